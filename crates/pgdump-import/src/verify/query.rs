//! SQL generation for verification.
//!
//! The checksum hashes each row's text form, sorts the row hashes and hashes
//! the concatenation, so it does not depend on physical row order.

use crate::core::identifier::{quote_literal, quote_pg, TableRef};
use crate::error::Result;

use super::types::ForeignKey;

/// Row count and content checksum of a whole table.
pub fn count_checksum_query(table: &TableRef) -> Result<String> {
    Ok(format!(
        r#"SELECT count(*)::bigint AS row_count,
       md5(coalesce(string_agg(md5(t::text), '' ORDER BY md5(t::text)), '')) AS checksum
FROM {table} t"#,
        table = table.quoted()?,
    ))
}

/// Foreign keys declared on `table`, with column lists as JSON arrays in
/// key order.
pub fn foreign_keys_query(table: &TableRef) -> Result<String> {
    Ok(format!(
        r#"SELECT c.conname AS constraint_name,
       cn.nspname AS child_schema,
       cl.relname AS child_table,
       pn.nspname AS parent_schema,
       pl.relname AS parent_table,
       (SELECT array_to_json(array_agg(a.attname ORDER BY k.ord))::text
          FROM unnest(c.conkey) WITH ORDINALITY AS k(attnum, ord)
          JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = k.attnum) AS child_columns,
       (SELECT array_to_json(array_agg(a.attname ORDER BY k.ord))::text
          FROM unnest(c.confkey) WITH ORDINALITY AS k(attnum, ord)
          JOIN pg_attribute a ON a.attrelid = c.confrelid AND a.attnum = k.attnum) AS parent_columns
FROM pg_constraint c
JOIN pg_class cl ON cl.oid = c.conrelid
JOIN pg_namespace cn ON cn.oid = cl.relnamespace
JOIN pg_class pl ON pl.oid = c.confrelid
JOIN pg_namespace pn ON pn.oid = pl.relnamespace
WHERE c.contype = 'f'
  AND c.conrelid = to_regclass({regclass})
ORDER BY c.conname"#,
        regclass = quote_literal(&table.quoted()?),
    ))
}

/// Child rows of `fk` whose non-NULL key has no parent row.
pub fn orphan_count_query(fk: &ForeignKey) -> Result<String> {
    let mut not_null = Vec::with_capacity(fk.child_columns.len());
    let mut join = Vec::with_capacity(fk.child_columns.len());
    for (child, parent) in fk.child_columns.iter().zip(&fk.parent_columns) {
        let child = quote_pg(child)?;
        not_null.push(format!("c.{} IS NOT NULL", child));
        join.push(format!("p.{} = c.{}", quote_pg(parent)?, child));
    }

    Ok(format!(
        r#"SELECT count(*)::bigint AS orphans
FROM {child} c
WHERE {not_null}
  AND NOT EXISTS (SELECT 1 FROM {parent} p WHERE {join})"#,
        child = fk.child.quoted()?,
        parent = fk.parent.quoted()?,
        not_null = not_null.join(" AND "),
        join = join.join(" AND "),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_checksum_query() {
        let sql = count_checksum_query(&TableRef::new("public", "Order Items")).unwrap();
        assert!(sql.contains(r#"FROM "public"."Order Items" t"#));
        assert!(sql.contains("ORDER BY md5(t::text)"));
    }

    #[test]
    fn test_foreign_keys_query_targets_table() {
        let sql = foreign_keys_query(&TableRef::new("sales", "orders")).unwrap();
        assert!(sql.contains(r#"to_regclass('"sales"."orders"')"#));
        assert!(sql.contains("c.contype = 'f'"));
    }

    #[test]
    fn test_orphan_query_composite_key() {
        let fk = ForeignKey {
            name: "items_order_fk".into(),
            child: TableRef::new("public", "items"),
            child_columns: vec!["order_id".into(), "region".into()],
            parent: TableRef::new("public", "orders"),
            parent_columns: vec!["id".into(), "region".into()],
        };
        let sql = orphan_count_query(&fk).unwrap();
        assert!(sql.contains(r#"WHERE c."order_id" IS NOT NULL AND c."region" IS NOT NULL"#));
        assert!(sql.contains(
            r#"NOT EXISTS (SELECT 1 FROM "public"."orders" p WHERE p."id" = c."order_id" AND p."region" = c."region")"#
        ));
    }
}
