//! Entity codec: [`GraphNode`] ⇄ [`Record`].
//!
//! A record is a self-describing snapshot of one block. Structural links are
//! stored by id in `connections` and are never restored here; the
//! [`reconcile`](crate::reconcile) pass does that once every referenced node
//! exists locally.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::workspace::{EditorSurface, SurfaceError};
use crate::{BlockFlags, FieldValue, GraphNode, Position};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("record has no block id")]
    MissingId,
    #[error("record {0} has no block type")]
    MissingType(String),
    #[error("node {id} holds a non-finite {what}")]
    NonFinite { id: String, what: String },
    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

/// Replicated projection of a block.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Record {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<BlockFlags>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub connections: BTreeMap<String, String>,
}

impl Record {
    /// Smallest well-formed record: identity only.
    pub fn minimal(id: impl Into<String>, block_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            block_type: block_type.into(),
            position: None,
            fields: BTreeMap::new(),
            flags: None,
            connections: BTreeMap::new(),
        }
    }

    pub fn is_minimal(&self) -> bool {
        self.position.is_none()
            && self.fields.is_empty()
            && self.flags.is_none()
            && self.connections.is_empty()
    }
}

/// Result of applying a record to a surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOutcome {
    pub created: bool,
    /// Surface writes issued, creation included.
    pub mutations: usize,
}

/// Snapshot a node into a record. Never fails: a node whose state cannot be
/// represented yields [`Record::minimal`].
pub fn encode(node: &GraphNode) -> Record {
    match try_encode(node) {
        Ok(record) => record,
        Err(e) => {
            log::warn!("Falling back to minimal record for {}: {e}", node.id);
            Record::minimal(node.id.clone(), node.block_type.clone())
        }
    }
}

fn try_encode(node: &GraphNode) -> Result<Record, CodecError> {
    if !node.position.is_finite() {
        return Err(CodecError::NonFinite {
            id: node.id.clone(),
            what: "position".into(),
        });
    }
    if let Some((name, _)) = node.fields.iter().find(|(_, v)| !v.is_finite()) {
        return Err(CodecError::NonFinite {
            id: node.id.clone(),
            what: format!("field {name}"),
        });
    }

    let connections = node
        .links
        .iter()
        .filter(|(_, target)| !target.is_empty())
        .map(|(slot, target)| (slot.clone(), target.clone()))
        .collect();

    Ok(Record {
        id: node.id.clone(),
        block_type: node.block_type.clone(),
        position: Some(node.position),
        fields: node.fields.clone(),
        flags: Some(node.flags),
        connections,
    })
}

/// Find or create the node named by `record` and bring its position, fields
/// and flags in line with it. Writes that would not change anything are
/// skipped, so applying the same record twice mutates nothing the second
/// time. A node of a different type is replaced.
pub fn decode<S: EditorSurface + ?Sized>(
    record: &Record,
    surface: &mut S,
) -> Result<DecodeOutcome, CodecError> {
    if record.id.is_empty() {
        return Err(CodecError::MissingId);
    }
    if record.block_type.is_empty() {
        return Err(CodecError::MissingType(record.id.clone()));
    }

    let mut outcome = DecodeOutcome::default();
    let existing_type = surface.node(&record.id).map(|n| n.block_type.clone());
    match existing_type {
        Some(t) if t == record.block_type => {}
        Some(t) => {
            log::debug!("Replacing {} ({t}) with type {}", record.id, record.block_type);
            surface.delete_node(&record.id)?;
            surface.create_node(&record.block_type, &record.id)?;
            outcome.created = true;
            outcome.mutations += 2;
        }
        None => {
            surface.create_node(&record.block_type, &record.id)?;
            outcome.created = true;
            outcome.mutations += 1;
        }
    }

    if let Some(position) = record.position {
        if position.is_finite() {
            let current = surface.node(&record.id).map(|n| n.position);
            if current != Some(position) {
                surface.move_node_to(&record.id, position)?;
                outcome.mutations += 1;
            }
        } else {
            log::warn!("Ignoring non-finite position on record {}", record.id);
        }
    }

    for (name, value) in &record.fields {
        if surface.field(&record.id, name) == Some(value) {
            continue;
        }
        surface.set_field(&record.id, name, value.clone())?;
        outcome.mutations += 1;
    }

    if let Some(flags) = record.flags {
        let current = surface.node(&record.id).map(|n| n.flags);
        if current != Some(flags) {
            surface.set_flags(&record.id, flags)?;
            outcome.mutations += 1;
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::BlockWorkspace;
    use crate::NEXT_SLOT;

    fn sample_node() -> GraphNode {
        let mut node = GraphNode::new("b1", "math_arithmetic");
        node.position = Position::new(50.0, 60.0);
        node.fields.insert("OP".into(), FieldValue::from("ADD"));
        node.fields.insert("PRECISION".into(), FieldValue::from(2.0));
        node.flags.collapsed = true;
        node.flags.inline_inputs = true;
        node.links.insert("A".into(), "b2".into());
        node.links.insert(NEXT_SLOT.into(), "b3".into());
        node
    }

    #[test]
    fn test_encode_captures_everything() {
        let record = encode(&sample_node());
        assert_eq!(record.id, "b1");
        assert_eq!(record.block_type, "math_arithmetic");
        assert_eq!(record.position, Some(Position::new(50.0, 60.0)));
        assert_eq!(record.fields.len(), 2);
        assert!(record.flags.unwrap().collapsed);
        assert_eq!(record.connections.get("A").map(String::as_str), Some("b2"));
        assert_eq!(record.connections.get(NEXT_SLOT).map(String::as_str), Some("b3"));
    }

    #[test]
    fn test_encode_omits_empty_slots() {
        let node = GraphNode::new("b1", "math_number");
        let record = encode(&node);
        assert!(record.connections.is_empty());
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("connections"));
    }

    #[test]
    fn test_encode_falls_back_on_non_finite_state() {
        let mut node = sample_node();
        node.position.x = f64::NAN;
        let record = encode(&node);
        assert_eq!(record, Record::minimal("b1", "math_arithmetic"));

        let mut node = sample_node();
        node.fields.insert("NUM".into(), FieldValue::Number(f64::INFINITY));
        assert!(encode(&node).is_minimal());
    }

    #[test]
    fn test_decode_round_trip() {
        let original = sample_node();
        let mut ws = BlockWorkspace::new();
        let outcome = decode(&encode(&original), &mut ws).unwrap();
        assert!(outcome.created);

        let restored = ws.node("b1").unwrap();
        assert_eq!(restored.id, original.id);
        assert_eq!(restored.block_type, original.block_type);
        assert_eq!(restored.position, original.position);
        assert_eq!(restored.fields, original.fields);
        assert_eq!(restored.flags, original.flags);
        // Links are left to the reconciler.
        assert!(restored.links.is_empty());
    }

    #[test]
    fn test_decode_is_idempotent() {
        let record = encode(&sample_node());
        let mut ws = BlockWorkspace::new();
        decode(&record, &mut ws).unwrap();
        ws.drain_events();

        let second = decode(&record, &mut ws).unwrap();
        assert_eq!(second, DecodeOutcome::default());
        assert!(ws.drain_events().is_empty());
    }

    #[test]
    fn test_decode_minimal_record() {
        let mut ws = BlockWorkspace::new();
        decode(&Record::minimal("b9", "logic_boolean"), &mut ws).unwrap();
        let node = ws.node("b9").unwrap();
        assert_eq!(node.block_type, "logic_boolean");
        assert_eq!(node.position, Position::default());
    }

    #[test]
    fn test_decode_rejects_missing_type() {
        let mut ws = BlockWorkspace::new();
        let err = decode(&Record::minimal("b1", ""), &mut ws).unwrap_err();
        assert!(matches!(err, CodecError::MissingType(id) if id == "b1"));
        assert!(ws.is_empty());
    }

    #[test]
    fn test_decode_replaces_changed_type() {
        let mut ws = BlockWorkspace::new();
        decode(&Record::minimal("b1", "math_number"), &mut ws).unwrap();
        let outcome = decode(&Record::minimal("b1", "text"), &mut ws).unwrap();
        assert!(outcome.created);
        assert_eq!(ws.node("b1").unwrap().block_type, "text");
    }

    #[test]
    fn test_record_json_scenario_shape() {
        let json = r#"{"id":"b1","type":"math_number","position":{"x":50,"y":60},"fields":{"NUM":5}}"#;
        let record: Record = serde_json::from_str(json).unwrap();
        let mut ws = BlockWorkspace::new();
        decode(&record, &mut ws).unwrap();
        let node = ws.node("b1").unwrap();
        assert_eq!(node.position, Position::new(50.0, 60.0));
        assert_eq!(node.fields["NUM"], FieldValue::Number(5.0));
    }

    #[test]
    fn test_record_without_type_fails_to_parse() {
        let parsed: Result<Record, _> = serde_json::from_str(r#"{"id":"b1"}"#);
        assert!(parsed.is_err());
    }
}
