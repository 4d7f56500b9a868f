//! Change records and changesets.
//!
//! A changeset is the coalesced set of row-level changes pending against one
//! tracked table, keyed by change key (the primary-key tuple, or the whole
//! row for keyless tables). Raw audit events arrive in mutation order and
//! collapse so that each key appears at most once:
//!
//! - INSERT + DELETE   → no record
//! - INSERT + UPDATE   → INSERT with merged payload
//! - UPDATE + UPDATE   → UPDATE with merged payload
//! - UPDATE + DELETE   → DELETE
//! - DELETE + INSERT   → UPDATE with the insert's payload
//!
//! An UPDATE that modifies a change-key column is split into DELETE(old key)
//! + INSERT(new key) before coalescence; a change key is therefore stable
//! across the lifetime of every record that carries it.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::error::StrataError;
use crate::schema::TableSchema;

/// Action discriminator, stored in diff fragments as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ChangeAction {
    Insert = 0,
    Delete = 1,
    Update = 2,
}

impl ChangeAction {
    pub fn from_i16(raw: i16) -> Result<Self, StrataError> {
        match raw {
            0 => Ok(ChangeAction::Insert),
            1 => Ok(ChangeAction::Delete),
            2 => Ok(ChangeAction::Update),
            other => Err(StrataError::engine(format!(
                "unknown change action discriminator: {other}"
            ))),
        }
    }

    pub fn as_i16(&self) -> i16 {
        *self as i16
    }
}

/// Non-key columns carried by an INSERT or UPDATE record.
///
/// Serialized in the compact `{"c": [...], "v": [...]}` wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    #[serde(rename = "c")]
    pub columns: Vec<String>,
    #[serde(rename = "v")]
    pub values: Vec<Value>,
}

impl ChangePayload {
    /// Extract `columns` from a JSON row; absent columns become NULL.
    pub fn from_row(row: &Map<String, Value>, columns: &[String]) -> Self {
        let values = columns
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        ChangePayload {
            columns: columns.to_vec(),
            values,
        }
    }

    /// Merge `overlay` over `self`: overlay values win per column, columns
    /// unique to either side are kept.
    pub fn merged(&self, overlay: &ChangePayload) -> ChangePayload {
        let mut columns = self.columns.clone();
        let mut values = self.values.clone();
        for (col, val) in overlay.columns.iter().zip(&overlay.values) {
            match columns.iter().position(|c| c == col) {
                Some(i) => values[i] = val.clone(),
                None => {
                    columns.push(col.clone());
                    values.push(val.clone());
                }
            }
        }
        ChangePayload { columns, values }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// One coalesced change to one row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Change-key values, in change-key column order.
    pub key: Vec<Value>,
    pub action: ChangeAction,
    /// Absent for DELETE.
    pub payload: Option<ChangePayload>,
}

impl ChangeRecord {
    /// Canonical text form of the key, used for per-fragment uniqueness and
    /// as the record sort order inside object digests.
    pub fn canonical_key(&self) -> String {
        serde_json::to_string(&self.key).expect("key values serialize")
    }
}

/// Raw mutation kinds reported by the audit log (`TG_OP`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOp {
    Insert,
    Update,
    Delete,
}

impl FromStr for AuditOp {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(AuditOp::Insert),
            "UPDATE" => Ok(AuditOp::Update),
            "DELETE" => Ok(AuditOp::Delete),
            other => Err(StrataError::engine(format!("unknown audit action: {other}"))),
        }
    }
}

/// One row of the audit log, in mutation order.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub op: AuditOp,
    /// Row image before the mutation (absent for INSERT).
    pub old_row: Option<Map<String, Value>>,
    /// Row image after the mutation (absent for DELETE).
    pub new_row: Option<Map<String, Value>>,
}

/// The pending, coalesced changes for one tracked table.
#[derive(Debug, Clone)]
pub struct Changeset {
    key_columns: Vec<String>,
    entries: BTreeMap<String, ChangeRecord>,
}

impl Changeset {
    pub fn new(key_columns: Vec<String>) -> Self {
        Changeset {
            key_columns,
            entries: BTreeMap::new(),
        }
    }

    /// Replay an ordered audit-event stream into a coalesced changeset.
    pub fn from_audit(
        schema: &TableSchema,
        events: impl IntoIterator<Item = AuditEvent>,
    ) -> Result<Self, StrataError> {
        let key_columns = schema.change_key_columns();
        let non_key = schema.non_key_columns();
        let mut changeset = Changeset::new(key_columns.clone());

        for event in events {
            match event.op {
                AuditOp::Insert => {
                    let row = event
                        .new_row
                        .ok_or_else(|| StrataError::engine("INSERT audit event without new row"))?;
                    changeset.record_insert(
                        key_from_row(&row, &key_columns),
                        ChangePayload::from_row(&row, &non_key),
                    );
                }
                AuditOp::Delete => {
                    let row = event
                        .old_row
                        .ok_or_else(|| StrataError::engine("DELETE audit event without old row"))?;
                    changeset.record_delete(key_from_row(&row, &key_columns));
                }
                AuditOp::Update => {
                    let old = event
                        .old_row
                        .ok_or_else(|| StrataError::engine("UPDATE audit event without old row"))?;
                    let new = event
                        .new_row
                        .ok_or_else(|| StrataError::engine("UPDATE audit event without new row"))?;
                    let old_key = key_from_row(&old, &key_columns);
                    let new_key = key_from_row(&new, &key_columns);
                    if old_key == new_key {
                        let changed: Vec<String> = non_key
                            .iter()
                            .filter(|c| old.get(*c) != new.get(*c))
                            .cloned()
                            .collect();
                        if !changed.is_empty() {
                            changeset
                                .record_update(new_key, ChangePayload::from_row(&new, &changed));
                        }
                    } else {
                        // A key-altering update is two changes: the old row
                        // is gone, the new row appears under its own key.
                        changeset.record_delete(old_key);
                        changeset.record_insert(
                            new_key,
                            ChangePayload::from_row(&new, &non_key),
                        );
                    }
                }
            }
        }
        Ok(changeset)
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Coalesced records, sorted by canonical key.
    pub fn records(&self) -> Vec<ChangeRecord> {
        self.entries.values().cloned().collect()
    }

    /// `(inserted, deleted, updated)` record counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for record in self.entries.values() {
            match record.action {
                ChangeAction::Insert => counts.0 += 1,
                ChangeAction::Delete => counts.1 += 1,
                ChangeAction::Update => counts.2 += 1,
            }
        }
        counts
    }

    pub fn record_insert(&mut self, key: Vec<Value>, payload: ChangePayload) {
        self.record(ChangeRecord {
            key,
            action: ChangeAction::Insert,
            payload: Some(payload),
        });
    }

    pub fn record_delete(&mut self, key: Vec<Value>) {
        self.record(ChangeRecord {
            key,
            action: ChangeAction::Delete,
            payload: None,
        });
    }

    pub fn record_update(&mut self, key: Vec<Value>, payload: ChangePayload) {
        self.record(ChangeRecord {
            key,
            action: ChangeAction::Update,
            payload: Some(payload),
        });
    }

    /// Coalesce one incoming record against the pending entry for its key.
    fn record(&mut self, incoming: ChangeRecord) {
        use ChangeAction::{Delete, Insert, Update};

        let key = incoming.canonical_key();
        let Some(prev) = self.entries.get(&key) else {
            self.entries.insert(key, incoming);
            return;
        };

        let next = match (prev.action, incoming.action) {
            // The row never existed as far as the parent image is concerned.
            (Insert, Delete) => None,
            (Insert, Update) => Some(ChangeRecord {
                action: Insert,
                payload: merge_payloads(&prev.payload, &incoming.payload),
                key: incoming.key,
            }),
            (Update, Update) => Some(ChangeRecord {
                action: Update,
                payload: merge_payloads(&prev.payload, &incoming.payload),
                key: incoming.key,
            }),
            (Update, Delete) | (Delete, Delete) => Some(ChangeRecord {
                action: Delete,
                payload: None,
                key: incoming.key,
            }),
            // The base row existed before the delete, so deleting and
            // re-inserting nets out to an in-place rewrite.
            (Delete, Insert) => Some(ChangeRecord {
                action: Update,
                payload: incoming.payload,
                key: incoming.key,
            }),
            // Remaining pairs cannot be produced by a PK-enforcing engine;
            // keep the latest state.
            _ => Some(incoming),
        };

        match next {
            Some(record) => {
                self.entries.insert(key, record);
            }
            None => {
                self.entries.remove(&key);
            }
        }
    }
}

fn merge_payloads(
    base: &Option<ChangePayload>,
    overlay: &Option<ChangePayload>,
) -> Option<ChangePayload> {
    match (base, overlay) {
        (Some(b), Some(o)) => Some(b.merged(o)),
        (Some(b), None) => Some(b.clone()),
        (None, o) => o.clone(),
    }
}

/// Extract change-key values from a JSON row, in key-column order.
pub fn key_from_row(row: &Map<String, Value>, key_columns: &[String]) -> Vec<Value> {
    key_columns
        .iter()
        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSpec;
    use serde_json::json;

    fn spec() -> TableSchema {
        TableSchema::new(vec![
            ColumnSpec {
                ordinal: 1,
                name: "id".into(),
                col_type: "integer".into(),
                is_pk: true,
            },
            ColumnSpec {
                ordinal: 2,
                name: "v".into(),
                col_type: "text".into(),
                is_pk: false,
            },
        ])
    }

    fn row(id: i64, v: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("id".into(), json!(id));
        m.insert("v".into(), json!(v));
        m
    }

    fn insert_event(id: i64, v: &str) -> AuditEvent {
        AuditEvent {
            op: AuditOp::Insert,
            old_row: None,
            new_row: Some(row(id, v)),
        }
    }

    fn update_event(id: i64, old_v: &str, new_v: &str) -> AuditEvent {
        AuditEvent {
            op: AuditOp::Update,
            old_row: Some(row(id, old_v)),
            new_row: Some(row(id, new_v)),
        }
    }

    fn delete_event(id: i64, v: &str) -> AuditEvent {
        AuditEvent {
            op: AuditOp::Delete,
            old_row: Some(row(id, v)),
            new_row: None,
        }
    }

    // ── coalescence rules ───────────────────────────────────────────

    #[test]
    fn test_insert_then_delete_collapses_to_nothing() {
        let cs =
            Changeset::from_audit(&spec(), [insert_event(1, "a"), delete_event(1, "a")]).unwrap();
        assert!(cs.is_empty());
    }

    #[test]
    fn test_insert_then_update_stays_insert() {
        let cs =
            Changeset::from_audit(&spec(), [insert_event(1, "a"), update_event(1, "a", "b")])
                .unwrap();
        let records = cs.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, ChangeAction::Insert);
        assert_eq!(records[0].payload.as_ref().unwrap().values, vec![json!("b")]);
    }

    #[test]
    fn test_update_then_update_merges_payloads() {
        let cs =
            Changeset::from_audit(&spec(), [update_event(1, "a", "b"), update_event(1, "b", "c")])
                .unwrap();
        let records = cs.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, ChangeAction::Update);
        assert_eq!(records[0].payload.as_ref().unwrap().values, vec![json!("c")]);
    }

    #[test]
    fn test_update_then_delete_becomes_delete() {
        let cs =
            Changeset::from_audit(&spec(), [update_event(1, "a", "b"), delete_event(1, "b")])
                .unwrap();
        let records = cs.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, ChangeAction::Delete);
        assert!(records[0].payload.is_none());
    }

    #[test]
    fn test_delete_then_insert_becomes_update() {
        let cs =
            Changeset::from_audit(&spec(), [delete_event(2, "b"), insert_event(2, "B")]).unwrap();
        let records = cs.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, ChangeAction::Update);
        assert_eq!(records[0].payload.as_ref().unwrap().values, vec![json!("B")]);
    }

    #[test]
    fn test_key_uniqueness_within_changeset() {
        let cs = Changeset::from_audit(
            &spec(),
            [
                insert_event(1, "a"),
                update_event(1, "a", "b"),
                insert_event(2, "x"),
                update_event(2, "x", "y"),
                update_event(2, "y", "z"),
            ],
        )
        .unwrap();
        assert_eq!(cs.len(), 2);
        let keys: Vec<String> = cs.records().iter().map(|r| r.canonical_key()).collect();
        let mut deduped = keys.clone();
        deduped.dedup();
        assert_eq!(keys, deduped);
    }

    // ── update semantics ────────────────────────────────────────────

    #[test]
    fn test_update_reports_only_changed_columns() {
        let cs = Changeset::from_audit(&spec(), [update_event(1, "a", "z")]).unwrap();
        let records = cs.records();
        assert_eq!(records[0].action, ChangeAction::Update);
        let payload = records[0].payload.as_ref().unwrap();
        assert_eq!(payload.columns, vec!["v"]);
    }

    #[test]
    fn test_identity_update_is_dropped() {
        let cs = Changeset::from_audit(&spec(), [update_event(1, "a", "a")]).unwrap();
        assert!(cs.is_empty());
    }

    #[test]
    fn test_key_altering_update_splits_into_delete_and_insert() {
        let event = AuditEvent {
            op: AuditOp::Update,
            old_row: Some(row(1, "a")),
            new_row: Some(row(9, "a")),
        };
        let cs = Changeset::from_audit(&spec(), [event]).unwrap();
        assert_eq!(cs.len(), 2);
        let records = cs.records();
        let delete = records.iter().find(|r| r.key == vec![json!(1)]).unwrap();
        let insert = records.iter().find(|r| r.key == vec![json!(9)]).unwrap();
        assert_eq!(delete.action, ChangeAction::Delete);
        assert_eq!(insert.action, ChangeAction::Insert);
    }

    // ── payloads ────────────────────────────────────────────────────

    #[test]
    fn test_payload_merge_overlay_wins() {
        let base = ChangePayload {
            columns: vec!["a".into(), "b".into()],
            values: vec![json!(1), json!(2)],
        };
        let overlay = ChangePayload {
            columns: vec!["b".into(), "c".into()],
            values: vec![json!(20), json!(30)],
        };
        let merged = base.merged(&overlay);
        assert_eq!(merged.columns, vec!["a", "b", "c"]);
        assert_eq!(merged.values, vec![json!(1), json!(20), json!(30)]);
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = ChangePayload {
            columns: vec!["v".into()],
            values: vec![json!("a")],
        };
        assert_eq!(
            serde_json::to_string(&payload).unwrap(),
            r#"{"c":["v"],"v":["a"]}"#
        );
    }

    #[test]
    fn test_action_wire_values() {
        assert_eq!(ChangeAction::Insert.as_i16(), 0);
        assert_eq!(ChangeAction::Delete.as_i16(), 1);
        assert_eq!(ChangeAction::Update.as_i16(), 2);
        assert!(ChangeAction::from_i16(3).is_err());
    }

    // ── keyless tables ──────────────────────────────────────────────

    #[test]
    fn test_keyless_table_uses_whole_row_key() {
        let spec = TableSchema::new(vec![
            ColumnSpec {
                ordinal: 1,
                name: "a".into(),
                col_type: "integer".into(),
                is_pk: false,
            },
            ColumnSpec {
                ordinal: 2,
                name: "b".into(),
                col_type: "text".into(),
                is_pk: false,
            },
        ]);
        let mut new_row = Map::new();
        new_row.insert("a".into(), json!(1));
        new_row.insert("b".into(), json!("x"));
        let cs = Changeset::from_audit(
            &spec,
            [AuditEvent {
                op: AuditOp::Insert,
                old_row: None,
                new_row: Some(new_row),
            }],
        )
        .unwrap();
        let records = cs.records();
        assert_eq!(records[0].key, vec![json!(1), json!("x")]);
        assert!(records[0].payload.as_ref().unwrap().is_empty());
    }

    // ── model property: coalesced replay equals raw replay ──────────

    mod model {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeMap;

        type Model = BTreeMap<i64, String>;

        fn apply_records(base: &Model, records: &[ChangeRecord]) -> Model {
            let mut out = base.clone();
            for record in records {
                let id = record.key[0].as_i64().unwrap();
                match record.action {
                    ChangeAction::Insert | ChangeAction::Update => {
                        let payload = record.payload.as_ref().unwrap();
                        let v = payload
                            .columns
                            .iter()
                            .position(|c| c == "v")
                            .map(|i| payload.values[i].as_str().unwrap().to_string());
                        match record.action {
                            ChangeAction::Insert => {
                                out.insert(id, v.unwrap());
                            }
                            _ => {
                                if let Some(v) = v {
                                    out.insert(id, v);
                                }
                            }
                        }
                    }
                    ChangeAction::Delete => {
                        out.remove(&id);
                    }
                }
            }
            out
        }

        proptest! {
            #[test]
            fn coalesced_replay_matches_raw_replay(
                base in proptest::collection::btree_map(0i64..8, "[a-c]", 0..6),
                ops in proptest::collection::vec((0i64..8, "[a-c]"), 0..40),
            ) {
                let mut model = base.clone();
                let mut events = Vec::new();
                for (id, v) in ops {
                    match model.get(&id).cloned() {
                        Some(old_v) => {
                            // Alternate deterministically between update and
                            // delete based on the incoming value.
                            if v == "a" {
                                events.push(delete_event(id, &old_v));
                                model.remove(&id);
                            } else {
                                events.push(update_event(id, &old_v, &v));
                                model.insert(id, v);
                            }
                        }
                        None => {
                            events.push(insert_event(id, &v));
                            model.insert(id, v);
                        }
                    }
                }

                let cs = Changeset::from_audit(&spec(), events).unwrap();
                let records = cs.records();

                // Replaying the coalesced records over the base state yields
                // the same rows as the raw mutation sequence.
                prop_assert_eq!(apply_records(&base, &records), model);

                // Inserts only target keys absent from the base; deletes and
                // updates only target keys present in it.
                for record in &records {
                    let id = record.key[0].as_i64().unwrap();
                    match record.action {
                        ChangeAction::Insert => prop_assert!(!base.contains_key(&id)),
                        _ => prop_assert!(base.contains_key(&id)),
                    }
                }
            }
        }
    }
}
