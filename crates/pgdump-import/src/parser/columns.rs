//! Table shapes implied by a dump.
//!
//! Built from `CREATE TABLE` column lists, `ALTER TABLE ... SET DEFAULT`
//! statements (pg_dump emits sequence defaults that way) and the column
//! lists of `INSERT`/`COPY` statements.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::classify::skip_quoted;
use super::{ParsedSqlFile, StatementKind};
use crate::core::identifier::{split_qualified, TableRef};

/// One column as the dump declares it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    /// Type text as written, e.g. `character varying(255)`; `text` when only
    /// an insert column list mentions the column.
    pub data_type: String,
    pub not_null: bool,
    pub default: Option<String>,
}

/// A table as the dump expects it to look.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub table: TableRef,
    pub columns: Vec<ColumnDefinition>,
}

impl TableDefinition {
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn column_mut(&mut self, name: &str) -> Option<&mut ColumnDefinition> {
        self.columns.iter_mut().find(|c| c.name == name)
    }
}

static SET_DEFAULT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)\bALTER\s+COLUMN\s+("(?:[^"]|"")+"|[A-Za-z_][A-Za-z0-9_$]*)\s+SET\s+DEFAULT\s+(.+?)\s*;?\s*$"#)
        .unwrap()
});

const ELEMENT_CONSTRAINTS: [&str; 7] = [
    "CONSTRAINT",
    "PRIMARY",
    "UNIQUE",
    "CHECK",
    "FOREIGN",
    "EXCLUDE",
    "LIKE",
];

const TYPE_STOP_WORDS: [&str; 9] = [
    "NOT",
    "NULL",
    "DEFAULT",
    "CONSTRAINT",
    "PRIMARY",
    "UNIQUE",
    "CHECK",
    "REFERENCES",
    "GENERATED",
];

/// Derive table definitions from a parsed dump, in first-seen order.
pub fn implied_schema(parsed: &ParsedSqlFile) -> Vec<TableDefinition> {
    let mut order: Vec<String> = Vec::new();
    let mut tables: BTreeMap<String, TableDefinition> = BTreeMap::new();

    for stmt in &parsed.statements {
        let Some(target) = &stmt.target else { continue };
        let key = target.qualified();

        match stmt.kind {
            StatementKind::TableDdl => {
                let columns = parse_create_table_columns(&stmt.text);
                if !tables.contains_key(&key) {
                    order.push(key.clone());
                }
                tables.insert(
                    key,
                    TableDefinition {
                        table: target.clone(),
                        columns,
                    },
                );
            }
            StatementKind::SchemaDdl => {
                if let Some(caps) = SET_DEFAULT.captures(&stmt.text) {
                    let column = unquote_column(&caps[1]);
                    if let Some(col) = tables.get_mut(&key).and_then(|t| t.column_mut(&column)) {
                        col.default = Some(caps[2].trim().to_string());
                    }
                }
            }
            StatementKind::DataDml => {
                let table = tables.entry(key.clone()).or_insert_with(|| {
                    order.push(key.clone());
                    TableDefinition {
                        table: target.clone(),
                        columns: Vec::new(),
                    }
                });
                for name in insert_column_list(&stmt.text) {
                    if table.column(&name).is_none() {
                        table.columns.push(ColumnDefinition {
                            name,
                            data_type: "text".to_string(),
                            not_null: false,
                            default: None,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    order
        .into_iter()
        .filter_map(|key| tables.remove(&key))
        .collect()
}

/// Parse the column definitions of a `CREATE TABLE` statement.
pub fn parse_create_table_columns(sql: &str) -> Vec<ColumnDefinition> {
    let Some(body) = outer_parenthesized(sql) else {
        return Vec::new();
    };

    split_top_level(body, b',')
        .into_iter()
        .filter_map(|element| parse_column_element(element.trim()))
        .collect()
}

fn parse_column_element(element: &str) -> Option<ColumnDefinition> {
    let first_word = element
        .split_whitespace()
        .next()
        .map(|w| w.to_ascii_uppercase())?;
    if ELEMENT_CONSTRAINTS.contains(&first_word.as_str()) {
        return None;
    }

    let name_parts = split_qualified(element)?;
    let name = name_parts.first()?.clone();
    let name_len = name_token_len(element);
    let rest = element[name_len..].trim_start();

    let words = top_level_words(rest);
    let type_end = words
        .iter()
        .find(|(_, w)| TYPE_STOP_WORDS.contains(&w.to_ascii_uppercase().as_str()))
        .map(|(pos, _)| *pos)
        .unwrap_or(rest.len());
    let data_type = rest[..type_end].trim().to_string();

    let upper: Vec<String> = words.iter().map(|(_, w)| w.to_ascii_uppercase()).collect();
    let not_null = upper.windows(2).any(|w| w[0] == "NOT" && w[1] == "NULL")
        || upper.windows(2).any(|w| w[0] == "PRIMARY" && w[1] == "KEY");

    let default = upper.iter().position(|w| w == "DEFAULT").map(|idx| {
        let start = words[idx].0 + words[idx].1.len();
        let end = words[idx + 1..]
            .iter()
            .find(|(_, w)| {
                let w = w.to_ascii_uppercase();
                w != "NULL" && TYPE_STOP_WORDS.contains(&w.as_str()) || w == "COLLATE"
            })
            .map(|(pos, _)| *pos)
            .unwrap_or(rest.len());
        rest[start..end].trim().to_string()
    });

    if data_type.is_empty() {
        return None;
    }

    Some(ColumnDefinition {
        name,
        data_type,
        not_null,
        default,
    })
}

/// Column names listed before `VALUES` / `FROM stdin`.
fn insert_column_list(sql: &str) -> Vec<String> {
    let head_end = sql
        .to_ascii_uppercase()
        .find("VALUES")
        .or_else(|| sql.to_ascii_uppercase().find(" FROM "))
        .or_else(|| sql.to_ascii_uppercase().find("SELECT"))
        .unwrap_or(sql.len());
    let head = &sql[..head_end];
    match outer_parenthesized(head) {
        Some(list) => split_top_level(list, b',')
            .into_iter()
            .filter_map(|c| split_qualified(c.trim()).and_then(|p| p.into_iter().next()))
            .collect(),
        None => Vec::new(),
    }
}

fn unquote_column(raw: &str) -> String {
    split_qualified(raw)
        .and_then(|p| p.into_iter().next())
        .unwrap_or_else(|| raw.to_string())
}

/// Byte length of the leading (possibly quoted) name token.
fn name_token_len(element: &str) -> usize {
    let bytes = element.as_bytes();
    if bytes.first() == Some(&b'"') {
        return skip_quoted(bytes, 0, b'"');
    }
    element
        .find(|c: char| c.is_whitespace())
        .unwrap_or(element.len())
}

/// Contents of the first top-level parenthesized group.
fn outer_parenthesized(sql: &str) -> Option<&str> {
    let bytes = sql.as_bytes();
    let mut i = 0;
    let mut open: Option<usize> = None;
    let mut depth = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                i = skip_quoted(bytes, i, b'\'');
                continue;
            }
            b'"' => {
                i = skip_quoted(bytes, i, b'"');
                continue;
            }
            b'(' => {
                if depth == 0 {
                    open = Some(i + 1);
                }
                depth += 1;
            }
            b')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(start) = open {
                        return Some(&sql[start..i]);
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Split on `sep` outside quotes and parentheses.
fn split_top_level(text: &str, sep: u8) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                i = skip_quoted(bytes, i, b'\'');
                continue;
            }
            b'"' => {
                i = skip_quoted(bytes, i, b'"');
                continue;
            }
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b if b == sep && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if start < text.len() {
        parts.push(&text[start..]);
    }
    parts
}

/// Bare words outside quotes and parentheses, with their byte offsets.
fn top_level_words(text: &str) -> Vec<(usize, &str)> {
    let bytes = text.as_bytes();
    let mut words = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => i = skip_quoted(bytes, i, b'\''),
            b'"' => i = skip_quoted(bytes, i, b'"'),
            b'(' => {
                depth += 1;
                i += 1;
            }
            b')' => {
                depth = depth.saturating_sub(1);
                i += 1;
            }
            b if depth == 0 && (b.is_ascii_alphabetic() || b == b'_') => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                words.push((start, &text[start..i]));
            }
            _ => i += 1,
        }
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pg_dump_table_columns() {
        let sql = r#"CREATE TABLE public.users (
    id integer NOT NULL,
    email character varying(255) NOT NULL,
    "Display Name" text DEFAULT 'anon'::text,
    created_at timestamp with time zone DEFAULT now() NOT NULL,
    tags text[],
    CONSTRAINT users_email_check CHECK ((email <> ''::text))
);"#;
        let cols = parse_create_table_columns(sql);
        assert_eq!(cols.len(), 5);
        assert_eq!(cols[0].name, "id");
        assert_eq!(cols[0].data_type, "integer");
        assert!(cols[0].not_null);
        assert_eq!(cols[1].data_type, "character varying(255)");
        assert_eq!(cols[2].name, "Display Name");
        assert_eq!(cols[2].default.as_deref(), Some("'anon'::text"));
        assert!(!cols[2].not_null);
        assert_eq!(cols[3].data_type, "timestamp with time zone");
        assert_eq!(cols[3].default.as_deref(), Some("now()"));
        assert!(cols[3].not_null);
        assert_eq!(cols[4].data_type, "text[]");
    }

    #[test]
    fn test_primary_key_implies_not_null() {
        let cols = parse_create_table_columns("CREATE TABLE t (id bigint PRIMARY KEY, n int NULL);");
        assert!(cols[0].not_null);
        assert!(!cols[1].not_null);
    }

    #[test]
    fn test_implied_schema_merges_defaults_and_insert_columns() {
        let parsed = ParsedSqlFile::parse(
            "CREATE TABLE public.t (id integer NOT NULL);\n\
             ALTER TABLE ONLY public.t ALTER COLUMN id SET DEFAULT nextval('public.t_id_seq'::regclass);\n\
             INSERT INTO public.t (id, note) VALUES (1, 'x');\n\
             COPY public.other (a, b) FROM stdin;\n1\t2\n\\.\n",
        );
        let schema = implied_schema(&parsed);
        assert_eq!(schema.len(), 2);

        let t = &schema[0];
        assert_eq!(t.table.qualified(), "public.t");
        assert_eq!(
            t.column("id").unwrap().default.as_deref(),
            Some("nextval('public.t_id_seq'::regclass)")
        );
        assert_eq!(t.column("note").unwrap().data_type, "text");

        let other = &schema[1];
        assert_eq!(other.table.qualified(), "public.other");
        assert_eq!(other.columns.len(), 2);
    }
}
