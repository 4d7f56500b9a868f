//! Pushable predicates ("quals").
//!
//! The foreign-data-wrapper boundary hands the layered query engine a set of
//! single-column predicates, each either scalar (`field op value`) or
//! list-valued (`field op ANY/ALL (values)`), implicitly ANDed. Translation
//! produces `$n`-placeholder fragments plus bound values; expansion to
//! literal SQL happens in [`crate::sql::expand_placeholders`].
//!
//! Push-down is an optimization, never a filter of record: the upstream
//! executor re-applies every qual to the rows we return, so an unsupported
//! qual is simply not pushed down.

use serde_json::Value;

use crate::sql::quote_ident;

/// Operators accepted for push-down. Anything else is passed through
/// untranslated (the executor re-filters).
const SUPPORTED_OPERATORS: &[&str] = &[
    "=", "<>", "!=", "<", ">", "<=", ">=", "LIKE", "NOT LIKE", "ILIKE", "NOT ILIKE", "~~", "!~~",
];

/// Quantifier for list-valued quals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnyOrAll {
    Any,
    All,
}

impl AnyOrAll {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnyOrAll::Any => "ANY",
            AnyOrAll::All => "ALL",
        }
    }
}

/// A single pushable predicate on one column.
#[derive(Debug, Clone, PartialEq)]
pub enum Qual {
    Scalar {
        field: String,
        op: String,
        value: Value,
    },
    List {
        field: String,
        op: String,
        quantifier: AnyOrAll,
        values: Vec<Value>,
    },
}

impl Qual {
    pub fn scalar(field: impl Into<String>, op: impl Into<String>, value: Value) -> Self {
        Qual::Scalar {
            field: field.into(),
            op: op.into(),
            value,
        }
    }

    pub fn list(
        field: impl Into<String>,
        op: impl Into<String>,
        quantifier: AnyOrAll,
        values: Vec<Value>,
    ) -> Self {
        Qual::List {
            field: field.into(),
            op: op.into(),
            quantifier,
            values,
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Qual::Scalar { field, .. } | Qual::List { field, .. } => field,
        }
    }

    /// Whether this qual can be pushed down at all.
    pub fn is_supported(&self) -> bool {
        let op = match self {
            Qual::Scalar { op, .. } | Qual::List { op, .. } => op,
        };
        SUPPORTED_OPERATORS.contains(&op.to_uppercase().as_str())
    }

    /// Translate to a `$n`-placeholder fragment plus bound values, numbering
    /// placeholders from `start` (1-based).
    fn to_sql(&self, start: usize) -> (String, Vec<Value>) {
        match self {
            Qual::Scalar { field, op, value } => (
                format!("{} {} ${}", quote_ident(field), op, start),
                vec![value.clone()],
            ),
            Qual::List {
                field,
                op,
                quantifier,
                values,
            } => {
                let placeholders: Vec<String> = (0..values.len())
                    .map(|i| format!("${}", start + i))
                    .collect();
                (
                    format!(
                        "{} {} {}(ARRAY[{}])",
                        quote_ident(field),
                        op,
                        quantifier.as_str(),
                        placeholders.join(",")
                    ),
                    values.clone(),
                )
            }
        }
    }
}

/// Split quals into (pushable, passed-through).
pub fn partition_supported(quals: &[Qual]) -> (Vec<Qual>, Vec<Qual>) {
    quals.iter().cloned().partition(Qual::is_supported)
}

/// Translate pushable quals into one `AND`-joined fragment plus its bound
/// values. Returns `None` when there is nothing to push down.
pub fn quals_to_sql(quals: &[Qual]) -> Option<(String, Vec<Value>)> {
    if quals.is_empty() {
        return None;
    }
    let mut fragments = Vec::with_capacity(quals.len());
    let mut values = Vec::new();
    for qual in quals {
        let (sql, vals) = qual.to_sql(values.len() + 1);
        fragments.push(sql);
        values.extend(vals);
    }
    Some((fragments.join(" AND "), values))
}

/// Whether every qual references only change-key columns.
///
/// Change keys are never altered by an UPDATE record (key-altering updates
/// are emitted as DELETE + INSERT), so a key-only predicate's satisfaction is
/// invariant under the whole diff chain and the layered engine may skip its
/// update-preservation pass. Vacuously true for an empty qual set.
pub fn pk_only(quals: &[Qual], key_columns: &[String]) -> bool {
    quals
        .iter()
        .all(|q| key_columns.iter().any(|k| k == q.field()))
}
