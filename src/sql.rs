//! SQL string assembly helpers.
//!
//! Statements are assembled as plain strings: identifiers go through
//! [`quote_ident`], values are rendered as literals via [`fmt_literal`].
//! Fragments produced with `$n` placeholders (e.g. by the qual translator)
//! are expanded to literal form with [`expand_placeholders`] before they
//! reach the engine.

use serde_json::Value;

/// Quote a SQL identifier, doubling any embedded quote.
pub fn quote_ident(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for ch in name.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a schema-qualified table reference.
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Quote a string literal. Relies on `standard_conforming_strings`, which is
/// the server default: doubling embedded quotes is sufficient.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a JSON value as a SQL literal.
///
/// Scalars render as untyped literals so the server coerces them to the
/// target column type; arrays and objects render as quoted JSON text.
pub fn fmt_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_literal(s),
        other => quote_literal(&other.to_string()),
    }
}

/// Expand `$1`..`$n` placeholders in a fragment to rendered literals.
///
/// Replacement runs from the highest index down so `$1` never clobbers the
/// prefix of `$10`.
pub fn expand_placeholders(fragment: &str, values: &[Value]) -> String {
    let mut out = fragment.to_string();
    for (i, value) in values.iter().enumerate().rev() {
        out = out.replace(&format!("${}", i + 1), &fmt_literal(value));
    }
    out
}

/// Join column identifiers into a comma-separated list, each quoted and —
/// when `prefix` is given — qualified with that table reference.
pub fn join_idents(prefix: Option<&str>, cols: &[String]) -> String {
    let mut out = String::new();
    for col in cols {
        if !out.is_empty() {
            out.push_str(", ");
        }
        if let Some(prefix) = prefix {
            out.push_str(prefix);
            out.push('.');
        }
        out.push_str(&quote_ident(col));
    }
    out
}

/// Predicate matching one row by its change-key values.
///
/// Uses tuple equality when every value is non-null and falls back to
/// `IS NOT DISTINCT FROM` otherwise (keyless tables may carry NULLs in
/// their whole-row change key).
pub fn key_predicate(key_cols: &[String], key_vals: &[Value]) -> String {
    debug_assert_eq!(key_cols.len(), key_vals.len());
    if key_vals.iter().any(Value::is_null) {
        return key_cols
            .iter()
            .zip(key_vals)
            .map(|(c, v)| format!("{} IS NOT DISTINCT FROM {}", quote_ident(c), fmt_literal(v)))
            .collect::<Vec<_>>()
            .join(" AND ");
    }
    if key_cols.len() == 1 {
        return format!("{} = {}", quote_ident(&key_cols[0]), fmt_literal(&key_vals[0]));
    }
    format!(
        "({}) = ({})",
        join_idents(None, key_cols),
        key_vals.iter().map(fmt_literal).collect::<Vec<_>>().join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── quote_ident / qualified ─────────────────────────────────────

    #[test]
    fn test_quote_ident_simple() {
        assert_eq!(quote_ident("name"), "\"name\"");
    }

    #[test]
    fn test_quote_ident_with_embedded_quotes() {
        assert_eq!(quote_ident("col\"name"), "\"col\"\"name\"");
    }

    #[test]
    fn test_qualified() {
        assert_eq!(qualified("acme/repo", "t"), "\"acme/repo\".\"t\"");
    }

    // ── literals ────────────────────────────────────────────────────

    #[test]
    fn test_quote_literal_escapes_quotes() {
        assert_eq!(quote_literal("o'clock"), "'o''clock'");
    }

    #[test]
    fn test_fmt_literal_scalars() {
        assert_eq!(fmt_literal(&json!(null)), "NULL");
        assert_eq!(fmt_literal(&json!(true)), "TRUE");
        assert_eq!(fmt_literal(&json!(false)), "FALSE");
        assert_eq!(fmt_literal(&json!(42)), "42");
        assert_eq!(fmt_literal(&json!(-1.5)), "-1.5");
        assert_eq!(fmt_literal(&json!("a'b")), "'a''b'");
    }

    #[test]
    fn test_fmt_literal_nested_renders_as_json_text() {
        assert_eq!(fmt_literal(&json!([1, 2])), "'[1,2]'");
        assert_eq!(fmt_literal(&json!({"k": "v"})), "'{\"k\":\"v\"}'");
    }

    // ── expand_placeholders ─────────────────────────────────────────

    #[test]
    fn test_expand_placeholders_in_order() {
        let sql = expand_placeholders("\"a\" = $1 AND \"b\" = $2", &[json!(1), json!("x")]);
        assert_eq!(sql, "\"a\" = 1 AND \"b\" = 'x'");
    }

    #[test]
    fn test_expand_placeholders_double_digit() {
        let vals: Vec<_> = (1..=11).map(|i| json!(i)).collect();
        let fragment = (1..=11)
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(",");
        assert_eq!(
            expand_placeholders(&fragment, &vals),
            "1,2,3,4,5,6,7,8,9,10,11"
        );
    }

    // ── column lists ────────────────────────────────────────────────

    #[test]
    fn test_join_idents_bare() {
        let cols = vec!["id".to_string(), "name".to_string()];
        assert_eq!(join_idents(None, &cols), "\"id\", \"name\"");
    }

    #[test]
    fn test_join_idents_prefixed() {
        let cols = vec!["x".to_string(), "y".to_string()];
        assert_eq!(join_idents(Some("src"), &cols), "src.\"x\", src.\"y\"");
    }

    #[test]
    fn test_join_idents_empty() {
        assert_eq!(join_idents(None, &[]), "");
    }

    #[test]
    fn test_join_idents_quotes_each_column() {
        let cols = vec!["col\"1".to_string()];
        assert_eq!(join_idents(None, &cols), "\"col\"\"1\"");
    }

    // ── key_predicate ───────────────────────────────────────────────

    #[test]
    fn test_key_predicate_single_column() {
        let pred = key_predicate(&["id".to_string()], &[json!(2)]);
        assert_eq!(pred, "\"id\" = 2");
    }

    #[test]
    fn test_key_predicate_composite() {
        let pred = key_predicate(&["a".to_string(), "b".to_string()], &[json!(1), json!("x")]);
        assert_eq!(pred, "(\"a\", \"b\") = (1, 'x')");
    }

    #[test]
    fn test_key_predicate_with_null_uses_is_not_distinct() {
        let pred = key_predicate(&["a".to_string(), "b".to_string()], &[json!(1), json!(null)]);
        assert_eq!(
            pred,
            "\"a\" IS NOT DISTINCT FROM 1 AND \"b\" IS NOT DISTINCT FROM NULL"
        );
    }
}
