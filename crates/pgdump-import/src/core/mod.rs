//! Shared building blocks used across the engine.

pub mod identifier;

pub use identifier::{qualify_pg, quote_literal, quote_pg, validate_identifier, TableRef};
