//! Whole-workspace hierarchical snapshot.
//!
//! Used only to bootstrap an empty shared document, e.g. from a project file
//! loaded by the host. Input children are nested under their parent's
//! `inputs`; the statements following a block are listed in order under its
//! `next`:
//!
//! ```json
//! {"blocks":{"blocks":[{"type":"controls_if","id":"b1","x":10,"y":20,
//!   "inputs":{"DO0":{"block":{"type":"text_print","id":"b2"}}},
//!   "next":[{"type":"text_print","id":"b3"},{"type":"text_print","id":"b4"}]}]},
//!  "variables":[{"id":"v1","name":"count","type":""}]}
//! ```
//!
//! A nested `"next":{"block":{..}}` is accepted on input and flattened, but
//! long chains in that form run into the JSON parser's depth limit.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::workspace::{EditorSurface, SurfaceError};
use crate::{BlockFlags, FieldValue, Position, VariableRecord, NEXT_SLOT};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("invalid snapshot: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("snapshot lists block {0} more than once")]
    DuplicateId(String),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct WorkspaceSnapshot {
    #[serde(default)]
    pub blocks: BlockList,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VariableRecord>,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct BlockList {
    #[serde(default)]
    pub blocks: Vec<SnapshotBlock>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SnapshotBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub id: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<BlockFlags>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, ChildBlock>,
    /// Statement chain after this block, first follower first.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "deserialize_chain"
    )]
    pub next: Vec<SnapshotBlock>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ChildBlock {
    pub block: Box<SnapshotBlock>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChainRepr {
    Flat(Vec<SnapshotBlock>),
    Nested(ChildBlock),
}

fn deserialize_chain<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<SnapshotBlock>, D::Error> {
    Ok(match ChainRepr::deserialize(de)? {
        ChainRepr::Flat(chain) => chain,
        ChainRepr::Nested(child) => {
            // The child's own `next` is already flat.
            let mut head = *child.block;
            let rest = std::mem::take(&mut head.next);
            let mut chain = Vec::with_capacity(rest.len() + 1);
            chain.push(head);
            chain.extend(rest);
            chain
        }
    })
}

pub fn parse_snapshot(text: &str) -> Result<WorkspaceSnapshot, SnapshotError> {
    Ok(serde_json::from_str(text)?)
}

pub fn snapshot_to_string(snapshot: &WorkspaceSnapshot) -> Result<String, SnapshotError> {
    Ok(serde_json::to_string(snapshot)?)
}

/// Capture the whole surface. Top-level blocks are those no slot links to.
pub fn export_snapshot<S: EditorSurface + ?Sized>(surface: &S) -> WorkspaceSnapshot {
    let ids = surface.node_ids();
    let linked: HashSet<String> = ids
        .iter()
        .filter_map(|id| surface.node(id))
        .flat_map(|n| n.links.values().cloned())
        .collect();

    let mut visited = HashSet::new();
    let blocks = ids
        .iter()
        .filter(|id| !linked.contains(*id))
        .filter_map(|id| export_block(surface, id, &mut visited))
        .collect();

    WorkspaceSnapshot {
        blocks: BlockList { blocks },
        variables: surface.variables(),
    }
}

/// Export `id` with its inputs, then walk its statement chain in a loop.
fn export_block<S: EditorSurface + ?Sized>(
    surface: &S,
    id: &str,
    visited: &mut HashSet<String>,
) -> Option<SnapshotBlock> {
    let mut block = export_node(surface, id, visited)?;
    let mut cursor = next_of(surface, id);
    while let Some(target) = cursor {
        let Some(follower) = export_node(surface, &target, visited) else {
            break;
        };
        cursor = next_of(surface, &target);
        block.next.push(follower);
    }
    Some(block)
}

fn export_node<S: EditorSurface + ?Sized>(
    surface: &S,
    id: &str,
    visited: &mut HashSet<String>,
) -> Option<SnapshotBlock> {
    if !visited.insert(id.to_string()) {
        return None;
    }
    let node = surface.node(id)?;
    let mut block = SnapshotBlock {
        block_type: node.block_type.clone(),
        id: node.id.clone(),
        x: node.position.x,
        y: node.position.y,
        fields: node.fields.clone(),
        flags: (node.flags != BlockFlags::default()).then_some(node.flags),
        inputs: BTreeMap::new(),
        next: Vec::new(),
    };
    for (slot, target) in node.links.iter().filter(|(slot, _)| slot.as_str() != NEXT_SLOT) {
        if let Some(child) = export_block(surface, target, visited) {
            block.inputs.insert(slot.clone(), ChildBlock { block: Box::new(child) });
        }
    }
    Some(block)
}

fn next_of<S: EditorSurface + ?Sized>(surface: &S, id: &str) -> Option<String> {
    surface.node(id)?.linked(NEXT_SLOT).map(str::to_string)
}

/// Load a snapshot into the surface, returning the ids created.
///
/// Ids already present on the surface are rejected before anything is
/// created, so a failed import leaves the surface untouched.
pub fn import_snapshot<S: EditorSurface + ?Sized>(
    snapshot: &WorkspaceSnapshot,
    surface: &mut S,
) -> Result<Vec<String>, SnapshotError> {
    let mut seen = HashSet::new();
    for block in &snapshot.blocks.blocks {
        collect_ids(block, &mut seen)?;
    }
    if let Some(id) = seen.iter().find(|id| surface.node(id).is_some()) {
        return Err(SnapshotError::Surface(SurfaceError::DuplicateNode(id.clone())));
    }

    let known: HashSet<String> = surface.variables().into_iter().map(|v| v.id).collect();
    for variable in &snapshot.variables {
        if !known.contains(&variable.id) {
            surface.create_variable(variable.clone())?;
        }
    }

    let mut created = Vec::new();
    for block in &snapshot.blocks.blocks {
        import_block(block, surface, &mut created)?;
    }
    Ok(created)
}

fn collect_ids(block: &SnapshotBlock, seen: &mut HashSet<String>) -> Result<(), SnapshotError> {
    if !seen.insert(block.id.clone()) {
        return Err(SnapshotError::DuplicateId(block.id.clone()));
    }
    for child in block.inputs.values() {
        collect_ids(&child.block, seen)?;
    }
    for follower in &block.next {
        collect_ids(follower, seen)?;
    }
    Ok(())
}

fn import_block<S: EditorSurface + ?Sized>(
    block: &SnapshotBlock,
    surface: &mut S,
    created: &mut Vec<String>,
) -> Result<(), SnapshotError> {
    import_node(block, surface, created)?;

    let mut previous = block.id.as_str();
    for follower in &block.next {
        import_block(follower, surface, created)?;
        surface.connect_slot(previous, NEXT_SLOT, Some(&follower.id))?;
        previous = follower.id.as_str();
    }
    Ok(())
}

fn import_node<S: EditorSurface + ?Sized>(
    block: &SnapshotBlock,
    surface: &mut S,
    created: &mut Vec<String>,
) -> Result<(), SnapshotError> {
    surface.create_node(&block.block_type, &block.id)?;
    created.push(block.id.clone());
    surface.move_node_to(&block.id, Position::new(block.x, block.y))?;
    for (name, value) in &block.fields {
        surface.set_field(&block.id, name, value.clone())?;
    }
    if let Some(flags) = block.flags {
        surface.set_flags(&block.id, flags)?;
    }
    for (slot, child) in &block.inputs {
        import_block(&child.block, surface, created)?;
        surface.connect_slot(&block.id, slot, Some(&child.block.id))?;
    }
    Ok(())
}
