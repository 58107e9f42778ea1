//! Row-level conflict handling for INSERT statements.
//!
//! pg_dump emits plain INSERTs; when the target already holds some of the
//! rows, the configured [`OnConflict`] policy is applied by appending an
//! `ON CONFLICT` clause. COPY blocks cannot carry such a clause and are
//! left untouched.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::OnConflict;
use crate::core::identifier::TableRef;

static INSERT_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)^\s*INSERT\s+INTO\s+((?:"(?:[^"]|"")*"|[^\s("]+)(?:\s*\.\s*(?:"(?:[^"]|"")*"|[^\s(."]+))*)\s*(?:\(([^)]*)\))?\s*(?:VALUES|SELECT|DEFAULT|OVERRIDING)\b"#,
    )
    .unwrap()
});
static HAS_ON_CONFLICT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bON\s+CONFLICT\b").unwrap());

/// Key columns needed to build an upsert for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictKeys {
    pub primary_key: Vec<String>,
    /// All columns in ordinal order, used when the INSERT lists none.
    pub columns: Vec<String>,
}

/// Table an INSERT writes to, if the statement is an INSERT.
pub fn insert_target(text: &str) -> Option<TableRef> {
    let caps = INSERT_HEAD.captures(text)?;
    TableRef::parse(caps.get(1)?.as_str())
}

/// Explicit column list of an INSERT, unquoted.
pub fn insert_columns(text: &str) -> Option<Vec<String>> {
    let caps = INSERT_HEAD.captures(text)?;
    let list = caps.get(2)?.as_str();
    Some(list.split(',').map(unquote).filter(|c| !c.is_empty()).collect())
}

/// Apply `policy` to one statement.
///
/// Returns the statement unchanged when it is not an INSERT, already has an
/// ON CONFLICT clause, or the policy is [`OnConflict::Error`]. An update
/// without known primary key columns falls back to DO NOTHING.
pub fn rewrite<'a>(text: &'a str, policy: OnConflict, keys: Option<&ConflictKeys>) -> Cow<'a, str> {
    if policy == OnConflict::Error || HAS_ON_CONFLICT.is_match(text) {
        return Cow::Borrowed(text);
    }
    let Some(caps) = INSERT_HEAD.captures(text) else {
        return Cow::Borrowed(text);
    };

    let body = text.trim_end().trim_end_matches(';').trim_end();
    let clause = match (policy, keys) {
        (OnConflict::Update, Some(keys)) if !keys.primary_key.is_empty() => {
            let columns = caps
                .get(2)
                .map(|m| m.as_str().split(',').map(unquote).collect::<Vec<_>>())
                .unwrap_or_else(|| keys.columns.clone());
            let assignments: Vec<String> = columns
                .iter()
                .filter(|c| !c.is_empty() && !keys.primary_key.contains(c))
                .map(|c| format!("{} = EXCLUDED.{}", ident(c), ident(c)))
                .collect();
            let conflict_cols = keys
                .primary_key
                .iter()
                .map(|c| ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            if assignments.is_empty() {
                format!("ON CONFLICT ({}) DO NOTHING", conflict_cols)
            } else {
                format!(
                    "ON CONFLICT ({}) DO UPDATE SET {}",
                    conflict_cols,
                    assignments.join(", ")
                )
            }
        }
        _ => "ON CONFLICT DO NOTHING".to_string(),
    };

    Cow::Owned(format!("{} {};", body, clause))
}

fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn unquote(part: &str) -> String {
    let part = part.trim();
    if part.len() >= 2 && part.starts_with('"') && part.ends_with('"') {
        part[1..part.len() - 1].replace("\"\"", "\"")
    } else {
        part.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> ConflictKeys {
        ConflictKeys {
            primary_key: vec!["id".into()],
            columns: vec!["id".into(), "name".into(), "Email".into()],
        }
    }

    #[test]
    fn test_error_policy_is_passthrough() {
        let sql = "INSERT INTO t VALUES (1);";
        assert!(matches!(rewrite(sql, OnConflict::Error, None), Cow::Borrowed(_)));
    }

    #[test]
    fn test_skip_appends_do_nothing() {
        let out = rewrite("INSERT INTO public.t (id) VALUES (1), (2);\n", OnConflict::Skip, None);
        assert_eq!(out, "INSERT INTO public.t (id) VALUES (1), (2) ON CONFLICT DO NOTHING;");
    }

    #[test]
    fn test_update_with_column_list() {
        let out = rewrite(
            "INSERT INTO public.t (id, name) VALUES (1, 'a');",
            OnConflict::Update,
            Some(&keys()),
        );
        assert_eq!(
            out,
            "INSERT INTO public.t (id, name) VALUES (1, 'a') ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\";"
        );
    }

    #[test]
    fn test_update_without_column_list_uses_table_columns() {
        let out = rewrite("INSERT INTO t VALUES (1, 'a', 'x');", OnConflict::Update, Some(&keys()));
        assert!(out.ends_with(
            "ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\", \"Email\" = EXCLUDED.\"Email\";"
        ));
    }

    #[test]
    fn test_update_without_primary_key_skips() {
        let out = rewrite("INSERT INTO t VALUES (1);", OnConflict::Update, None);
        assert_eq!(out, "INSERT INTO t VALUES (1) ON CONFLICT DO NOTHING;");
    }

    #[test]
    fn test_existing_clause_and_non_inserts_untouched() {
        let sql = "INSERT INTO t VALUES (1) ON CONFLICT DO NOTHING;";
        assert_eq!(rewrite(sql, OnConflict::Update, Some(&keys())), sql);
        let ddl = "CREATE TABLE t (id int);";
        assert_eq!(rewrite(ddl, OnConflict::Skip, None), ddl);
    }

    #[test]
    fn test_insert_target_and_columns() {
        let sql = "INSERT INTO \"Sales\".\"Order Items\" (\"Id\", qty) VALUES (1, 2);";
        assert_eq!(
            insert_target(sql),
            Some(TableRef::new("Sales", "Order Items"))
        );
        assert_eq!(insert_columns(sql), Some(vec!["Id".to_string(), "qty".to_string()]));
        assert_eq!(insert_columns("INSERT INTO t VALUES (1);"), None);
    }
}
