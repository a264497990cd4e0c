//! Warehouse row to CRM property update.

use std::collections::BTreeMap;

use crmsync_core::{PendingUpdate, PropertyMapping, WarehouseRow};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappedRow {
    /// No usable identifier; never reaches the dispatcher or the checkpoint.
    Invalid,
    /// Every mapped value was blank. The identifier is still terminal.
    Discarded { identifier: String },
    Pending(PendingUpdate),
}

/// Text form of a warehouse value. `None` for null.
pub fn value_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn identifier(row: &WarehouseRow, id_column: &str) -> Option<String> {
    let text = value_text(row.get(id_column)?)?;
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn map_row(
    row: &WarehouseRow,
    mapping: &PropertyMapping,
    id_column: &str,
    drop_blanks: bool,
) -> MappedRow {
    let Some(identifier) = identifier(row, id_column) else {
        return MappedRow::Invalid;
    };

    let mut properties = BTreeMap::new();
    for (target, column) in mapping.pairs() {
        let Some(text) = row.get(column).and_then(value_text) else {
            continue;
        };
        if drop_blanks && text.trim().is_empty() {
            continue;
        }
        properties.insert(target.to_string(), text);
    }

    if properties.is_empty() {
        MappedRow::Discarded { identifier }
    } else {
        MappedRow::Pending(PendingUpdate {
            identifier,
            properties,
        })
    }
}
