//! Foreign-key aware ordering of data statements.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::identifier::TableRef;
use crate::parser::{Statement, StatementKind};

static REFERENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)\bREFERENCES\s+((?:"(?:[^"]|"")*"|[A-Za-z_][\w$]*)(?:\s*\.\s*(?:"(?:[^"]|"")*"|[A-Za-z_][\w$]*))?)"#)
        .unwrap()
});

/// `child -> parents` edges declared by FOREIGN KEY constraints and inline
/// REFERENCES clauses.
pub(crate) fn foreign_key_edges<'a, I>(statements: I) -> HashMap<String, HashSet<String>>
where
    I: IntoIterator<Item = &'a Statement>,
{
    let mut edges: HashMap<String, HashSet<String>> = HashMap::new();
    for stmt in statements {
        if !matches!(stmt.kind, StatementKind::Constraint | StatementKind::TableDdl) {
            continue;
        }
        let Some(child) = &stmt.target else { continue };
        for caps in REFERENCES.captures_iter(&stmt.text) {
            if let Some(parent) = caps.get(1).and_then(|m| TableRef::parse(m.as_str())) {
                if parent != *child {
                    edges
                        .entry(child.qualified())
                        .or_default()
                        .insert(parent.qualified());
                }
            }
        }
    }
    edges
}

/// Stable-sort `data` so tables load after the tables they reference.
///
/// Tables are ranked by a topological walk that always takes the earliest
/// table (by first data statement) whose parents are placed. Tables caught
/// in a cycle keep their file order.
pub(crate) fn order_data_statements<'a>(
    data: Vec<&'a Statement>,
    edges: &HashMap<String, HashSet<String>>,
) -> Vec<&'a Statement> {
    let mut tables: Vec<String> = Vec::new();
    for stmt in &data {
        if let Some(t) = &stmt.target {
            let name = t.qualified();
            if !tables.contains(&name) {
                tables.push(name);
            }
        }
    }
    let present: HashSet<&str> = tables.iter().map(String::as_str).collect();

    let mut placed: HashSet<String> = HashSet::new();
    let mut rank: HashMap<String, usize> = HashMap::new();
    while rank.len() < tables.len() {
        let ready = tables.iter().find(|t| {
            !placed.contains(*t)
                && edges.get(*t).map_or(true, |parents| {
                    parents
                        .iter()
                        .all(|p| placed.contains(p) || !present.contains(p.as_str()))
                })
        });
        // A cycle: fall back to the first unplaced table in file order.
        let next = ready
            .or_else(|| tables.iter().find(|t| !placed.contains(*t)))
            .cloned();
        let Some(next) = next else { break };
        rank.insert(next.clone(), rank.len());
        placed.insert(next);
    }

    let mut ordered = data;
    ordered.sort_by_key(|s| {
        s.target
            .as_ref()
            .and_then(|t| rank.get(&t.qualified()).copied())
            .unwrap_or(usize::MAX)
    });
    ordered
}
