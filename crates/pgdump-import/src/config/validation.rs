//! Configuration validation.

use super::{Config, ImportOptions, MAX_BATCH_SIZE, MIN_BATCH_SIZE};
use crate::core::identifier::validate_identifier;
use crate::error::{DumpImportError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    let conn = &config.connection;
    if conn.host.is_empty() {
        return Err(DumpImportError::Config("connection.host is required".into()));
    }
    if conn.database.is_empty() {
        return Err(DumpImportError::Config(
            "connection.database is required".into(),
        ));
    }
    if conn.user.is_empty() {
        return Err(DumpImportError::Config("connection.user is required".into()));
    }
    if conn.port == 0 {
        return Err(DumpImportError::Config(
            "connection.port must be non-zero".into(),
        ));
    }

    validate_options(&config.options)?;

    for schema in &config.alignment.allowed_schemas {
        validate_identifier(schema).map_err(|e| {
            DumpImportError::Config(format!("alignment.allowed_schemas: {}", e))
        })?;
    }

    for column in &config.alignment.required_not_null_columns {
        if column.split('.').count() != 3 {
            return Err(DumpImportError::Config(format!(
                "alignment.required_not_null_columns entry '{}' must be schema.table.column",
                column
            )));
        }
    }

    Ok(())
}

/// Validate import options.
pub fn validate_options(options: &ImportOptions) -> Result<()> {
    if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&options.batch_size) {
        return Err(DumpImportError::Config(format!(
            "options.batch_size must be between {} and {}, got {}",
            MIN_BATCH_SIZE, MAX_BATCH_SIZE, options.batch_size
        )));
    }
    if options.verify_concurrency == 0 {
        return Err(DumpImportError::Config(
            "options.verify_concurrency must be at least 1".into(),
        ));
    }
    if options.retry_attempts > 10 {
        return Err(DumpImportError::Config(
            "options.retry_attempts must be at most 10".into(),
        ));
    }
    for schema in &options.drop_if_exists.safe_schemas {
        validate_identifier(schema).map_err(|e| {
            DumpImportError::Config(format!("options.drop_if_exists.safe_schemas: {}", e))
        })?;
    }
    Ok(())
}
