//! # blockweave-core: block program model and sync engine
//!
//! Holds the program graph as the editor sees it ([`GraphNode`]), the
//! replicated projection of a node ([`codec::Record`]), and the engine that
//! keeps the two consistent ([`collab::SyncEngine`]).
//!
//! ```text
//!  EditorSurface ── events ──► OutboundSync ── set/delete ──► ReplicatedDocument
//!        ▲                                                         │
//!        └──────── decode + reconcile ◄── InboundApply ◄── changes ┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod codec;
pub mod collab;
pub mod reconcile;
pub mod snapshot;
pub mod workspace;

pub use codec::{decode, encode, CodecError, DecodeOutcome, Record};
pub use reconcile::{reconcile, ReconcileReport};
pub use snapshot::{
    export_snapshot, import_snapshot, parse_snapshot, snapshot_to_string, SnapshotError,
    WorkspaceSnapshot,
};
pub use workspace::{BlockWorkspace, ChangeTarget, EditorSurface, SurfaceError, WorkspaceEvent};

/// Slot name for the statement that follows a block.
pub const NEXT_SLOT: &str = "next";

/// Workspace coordinates of a block's top-left corner.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Scalar value held by a block field.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn is_finite(&self) -> bool {
        match self {
            FieldValue::Number(n) => n.is_finite(),
            _ => true,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

/// Per-block editor flags.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BlockFlags {
    pub enabled: bool,
    pub editable: bool,
    pub movable: bool,
    pub deletable: bool,
    pub collapsed: bool,
    pub inline_inputs: bool,
}

impl Default for BlockFlags {
    fn default() -> Self {
        Self {
            enabled: true,
            editable: true,
            movable: true,
            deletable: true,
            collapsed: false,
            inline_inputs: false,
        }
    }
}

/// A block as held by the editor surface.
///
/// `links` maps a slot name (an input name, or [`NEXT_SLOT`]) to the id of
/// the block plugged into it. A slot with nothing plugged in is absent.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub block_type: String,
    pub position: Position,
    pub fields: BTreeMap<String, FieldValue>,
    pub flags: BlockFlags,
    pub links: BTreeMap<String, String>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, block_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            block_type: block_type.into(),
            position: Position::default(),
            fields: BTreeMap::new(),
            flags: BlockFlags::default(),
            links: BTreeMap::new(),
        }
    }

    /// Id of the block plugged into `slot`, if any.
    pub fn linked(&self, slot: &str) -> Option<&str> {
        self.links.get(slot).map(String::as_str)
    }
}

/// A program-global variable.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct VariableRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: String,
}

impl VariableRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, var_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            var_type: var_type.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_node_defaults() {
        let node = GraphNode::new("b1", "math_number");
        assert_eq!(node.position, Position::default());
        assert!(node.flags.enabled);
        assert!(node.flags.deletable);
        assert!(!node.flags.collapsed);
        assert!(node.linked(NEXT_SLOT).is_none());
    }

    #[test]
    fn test_field_value_untagged_json() {
        let values: BTreeMap<String, FieldValue> =
            serde_json::from_str(r#"{"NUM":5,"OP":"ADD","ON":true}"#).unwrap();
        assert_eq!(values["NUM"], FieldValue::Number(5.0));
        assert_eq!(values["OP"], FieldValue::Text("ADD".into()));
        assert_eq!(values["ON"], FieldValue::Bool(true));
    }

    #[test]
    fn test_flags_partial_json_uses_defaults() {
        let flags: BlockFlags = serde_json::from_str(r#"{"collapsed":true}"#).unwrap();
        assert!(flags.collapsed);
        assert!(flags.enabled);
        assert!(flags.movable);
    }

    #[test]
    fn test_position_finite() {
        assert!(Position::new(1.0, 2.0).is_finite());
        assert!(!Position::new(f64::NAN, 2.0).is_finite());
        assert!(!FieldValue::Number(f64::INFINITY).is_finite());
    }

    #[test]
    fn test_variable_record_json_shape() {
        let var = VariableRecord::new("v1", "count", "Number");
        let json = serde_json::to_string(&var).unwrap();
        assert!(json.contains(r#""type":"Number""#));
        let back: VariableRecord = serde_json::from_str(r#"{"id":"v2","name":"x"}"#).unwrap();
        assert_eq!(back.var_type, "");
    }
}
