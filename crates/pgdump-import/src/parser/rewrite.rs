//! Statement rewrites applied just before dispatch.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::DropIfExistsConfig;
use crate::core::identifier::split_qualified;

static DROP_OBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)^\s*DROP\s+(TABLE|INDEX|SEQUENCE|VIEW)\s+(?:IF\s+EXISTS\s+)?((?:"(?:[^"]|"")*"|[A-Za-z_][\w$]*)(?:\s*\.\s*(?:"(?:[^"]|"")*"|[A-Za-z_][\w$]*))+)\s*(CASCADE|RESTRICT)?\s*;?\s*$"#,
    )
    .unwrap()
});

/// Rewrite a single-object `DROP TABLE|INDEX|SEQUENCE|VIEW` into its
/// `IF EXISTS` form.
///
/// Only schema-qualified names in one of `config.safe_schemas` qualify.
/// An explicit `CASCADE` or `RESTRICT` is kept; otherwise `CASCADE` is added
/// when `config.cascade` is set. Returns `None` when the statement is left
/// as written.
pub fn rewrite_drop(text: &str, config: &DropIfExistsConfig) -> Option<String> {
    if !config.allow_schema_drop {
        return None;
    }
    let caps = DROP_OBJECT.captures(text)?;
    let object = caps[1].to_ascii_uppercase();
    let name = &caps[2];

    let parts = split_qualified(name)?;
    let schema = parts.len().checked_sub(2).map(|i| &parts[i])?;
    if !config.safe_schemas.iter().any(|s| s == schema) {
        return None;
    }

    let behavior = match caps.get(3) {
        Some(explicit) => format!(" {}", explicit.as_str().to_ascii_uppercase()),
        None if config.cascade => " CASCADE".to_string(),
        None => String::new(),
    };
    Some(format!("DROP {} IF EXISTS {}{};", object, name, behavior))
}
