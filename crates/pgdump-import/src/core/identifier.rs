//! Identifier validation, quoting and table references.
//!
//! Identifiers cannot be bound as statement parameters, so every piece of
//! dynamic SQL the engine generates (alignment DDL, verification queries,
//! existence checks) routes names through this module.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DumpImportError, Result};

/// PostgreSQL truncates identifiers beyond NAMEDATALEN - 1 bytes.
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Schema assumed for unqualified names, matching pg_dump's search_path.
pub const DEFAULT_SCHEMA: &str = "public";

/// Validate an identifier before it is embedded in generated SQL.
///
/// Rejects empty identifiers, identifiers containing null bytes and
/// identifiers longer than PostgreSQL keeps.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DumpImportError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(DumpImportError::Config(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(DumpImportError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
///
/// ```ignore
/// assert_eq!(quote_pg("users")?, "\"users\"");
/// assert_eq!(quote_pg("table\"name")?, "\"table\"\"name\"");
/// ```
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Qualify a PostgreSQL table name with schema.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// A schema-qualified table name as it appears in a dump.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse a possibly-quoted, possibly-qualified name such as
    /// `"Sales"."Order Items"` or `public.users`.
    ///
    /// Unquoted parts are folded to lower case the way PostgreSQL does.
    /// Returns `None` when the text does not start with a name.
    pub fn parse(text: &str) -> Option<Self> {
        let parts = split_qualified(text.trim())?;
        match parts.len() {
            1 => Some(Self::new(DEFAULT_SCHEMA, parts[0].clone())),
            // database.schema.table: keep the last two
            n if n >= 2 => Some(Self::new(parts[n - 2].clone(), parts[n - 1].clone())),
            _ => None,
        }
    }

    /// `"schema"."table"` with quoting applied.
    pub fn quoted(&self) -> Result<String> {
        qualify_pg(&self.schema, &self.name)
    }

    /// Unquoted `schema.table`, used as a map key and in reports.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Split a dotted name into its unquoted parts.
///
/// Stops at the first character that cannot continue a name, so trailing
/// text such as `(id int)` or ` VALUES` is ignored.
pub(crate) fn split_qualified(text: &str) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    let mut chars = text.chars().peekable();

    loop {
        let mut part = String::new();
        match chars.peek() {
            Some('"') => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('"') if chars.peek() == Some(&'"') => {
                            chars.next();
                            part.push('"');
                        }
                        Some('"') => break,
                        Some(c) => part.push(c),
                        None => return None,
                    }
                }
            }
            Some(c) if is_ident_start(*c) => {
                while let Some(&c) = chars.peek() {
                    if is_ident_char(c) {
                        part.push(c.to_ascii_lowercase());
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            _ => break,
        }

        parts.push(part);
        if chars.peek() == Some(&'.') {
            chars.next();
        } else {
            break;
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

pub(crate) fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

pub(crate) fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}
