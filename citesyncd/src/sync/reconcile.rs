use citesync_core::EntityKind;
use serde_json::Value;

use super::store::LocalRecord;

/// Change applied to the local store after a confirmed mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// A created entity moved from its temporary id to its permanent one.
    IdReplaced {
        temp_id: String,
        record: LocalRecord,
    },
    Synced { kind: EntityKind, id: String },
    Removed { kind: EntityKind, id: String },
}

/// Ordered in-memory view of one entity kind, kept current by applying
/// [`Reconciliation`] events.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalCollection {
    kind: EntityKind,
    records: Vec<LocalRecord>,
}

impl LocalCollection {
    pub fn new(kind: EntityKind, records: Vec<LocalRecord>) -> Self {
        Self { kind, records }
    }

    pub fn records(&self) -> &[LocalRecord] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&LocalRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn push(&mut self, record: LocalRecord) {
        self.records.push(record);
    }

    /// Applies `event`, returning whether anything in the collection changed.
    ///
    /// A replaced id keeps its slot; children that pointed at the temporary
    /// id are re-parented. Applying the same event twice is a no-op.
    pub fn apply(&mut self, event: &Reconciliation) -> bool {
        match event {
            Reconciliation::IdReplaced { temp_id, record } => {
                let mut changed = false;
                for child in self
                    .records
                    .iter_mut()
                    .filter(|child| child.parent_id.as_deref() == Some(temp_id.as_str()))
                {
                    child.parent_id = Some(record.id.clone());
                    changed = true;
                }
                if record.kind != self.kind {
                    return changed;
                }
                if let Some(slot) = self.records.iter_mut().find(|r| &r.id == temp_id) {
                    *slot = record.clone();
                    changed = true;
                }
                changed
            }
            Reconciliation::Synced { kind, id } => {
                if *kind != self.kind {
                    return false;
                }
                match self.records.iter_mut().find(|r| &r.id == id) {
                    Some(record) if !record.synced || record.offline => {
                        record.synced = true;
                        record.offline = false;
                        true
                    }
                    _ => false,
                }
            }
            Reconciliation::Removed { kind, id } => {
                if *kind != self.kind {
                    return false;
                }
                let before = self.records.len();
                self.records.retain(|r| &r.id != id);
                before != self.records.len()
            }
        }
    }
}

/// Overlays the top-level fields of `incoming` onto `base`.
///
/// Non-object values replace `base` outright.
pub fn merge_fields(base: &Value, incoming: &Value) -> Value {
    match (base, incoming) {
        (Value::Object(base), Value::Object(incoming)) => {
            let mut merged = base.clone();
            for (key, value) in incoming {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, incoming) => incoming.clone(),
    }
}

/// Adds the top-level fields of `incoming` that `base` lacks, such as a
/// server-assigned `id`. Fields already present in `base` are kept.
pub fn fill_missing_fields(base: &Value, incoming: &Value) -> Value {
    match (base, incoming) {
        (Value::Object(base), Value::Object(incoming)) => {
            let mut merged = base.clone();
            for (key, value) in incoming {
                merged
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
            Value::Object(merged)
        }
        (Value::Null, incoming) => incoming.clone(),
        (base, _) => base.clone(),
    }
}
