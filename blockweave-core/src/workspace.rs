//! The editor surface seam.
//!
//! [`EditorSurface`] is everything the sync engine needs from the visual
//! editor: node CRUD, field and flag writes, slot connections, the variable
//! list, and a queued change feed. [`BlockWorkspace`] is the in-memory
//! implementation used by headless hosts and tests.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::{BlockFlags, FieldValue, GraphNode, Position, VariableRecord};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SurfaceError {
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("node already exists: {0}")]
    DuplicateNode(String),
    #[error("variable not found: {0}")]
    VariableNotFound(String),
    #[error("variable already exists: {0}")]
    DuplicateVariable(String),
    #[error("cannot connect {0} to itself")]
    SelfConnection(String),
    #[error("connecting {target} under {node} would create a cycle")]
    WouldCycle { node: String, target: String },
}

/// What a [`WorkspaceEvent::Change`] touched.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeTarget {
    Field(String),
    Flags,
}

/// Change feed emitted by an editor surface.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkspaceEvent {
    Create { node_id: String },
    Delete { node_id: String },
    Change { node_id: String, target: ChangeTarget },
    /// Position or outgoing slot links changed.
    Move { node_id: String },
    DragStart { node_id: String },
    DragEnd { node_id: String },
    VarCreate { var_id: String },
    VarRename { var_id: String },
    VarDelete { var_id: String },
    /// Selection only. Never synced.
    Selected { node_id: Option<String> },
}

impl WorkspaceEvent {
    /// Node this event concerns, for node-scoped events.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            WorkspaceEvent::Create { node_id }
            | WorkspaceEvent::Delete { node_id }
            | WorkspaceEvent::Change { node_id, .. }
            | WorkspaceEvent::Move { node_id }
            | WorkspaceEvent::DragStart { node_id }
            | WorkspaceEvent::DragEnd { node_id } => Some(node_id),
            _ => None,
        }
    }
}

/// Mutable node-graph API of the visual editor.
pub trait EditorSurface {
    fn create_node(&mut self, block_type: &str, id: &str) -> Result<(), SurfaceError>;

    fn node(&self, id: &str) -> Option<&GraphNode>;

    fn node_ids(&self) -> Vec<String>;

    fn delete_node(&mut self, id: &str) -> Result<(), SurfaceError>;

    /// Move a node by a relative offset.
    fn move_node(&mut self, id: &str, dx: f64, dy: f64) -> Result<(), SurfaceError>;

    /// Move a node to an absolute position.
    fn move_node_to(&mut self, id: &str, position: Position) -> Result<(), SurfaceError> {
        let current = self
            .node(id)
            .map(|n| n.position)
            .ok_or_else(|| SurfaceError::NodeNotFound(id.to_string()))?;
        if current == position {
            return Ok(());
        }
        self.move_node(id, position.x - current.x, position.y - current.y)
    }

    fn field(&self, id: &str, name: &str) -> Option<&FieldValue> {
        self.node(id).and_then(|n| n.fields.get(name))
    }

    fn set_field(&mut self, id: &str, name: &str, value: FieldValue) -> Result<(), SurfaceError>;

    fn set_flags(&mut self, id: &str, flags: BlockFlags) -> Result<(), SurfaceError>;

    /// Plug `target` into `slot` of `id`, or empty the slot when `target` is `None`.
    fn connect_slot(&mut self, id: &str, slot: &str, target: Option<&str>) -> Result<(), SurfaceError>;

    fn variables(&self) -> Vec<VariableRecord>;

    fn create_variable(&mut self, variable: VariableRecord) -> Result<(), SurfaceError>;

    fn rename_variable(&mut self, id: &str, name: &str) -> Result<(), SurfaceError>;

    fn delete_variable(&mut self, id: &str) -> Result<(), SurfaceError>;

    /// Take every event queued since the last call, oldest first.
    fn drain_events(&mut self) -> Vec<WorkspaceEvent>;
}

/// In-memory editor surface.
#[derive(Debug, Default)]
pub struct BlockWorkspace {
    nodes: BTreeMap<String, GraphNode>,
    variables: BTreeMap<String, VariableRecord>,
    events: Vec<WorkspaceEvent>,
    dragging: Option<String>,
}

impl BlockWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of events waiting to be drained.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Start a user drag gesture on `id`.
    pub fn begin_drag(&mut self, id: &str) -> Result<(), SurfaceError> {
        self.require(id)?;
        self.dragging = Some(id.to_string());
        self.events.push(WorkspaceEvent::DragStart { node_id: id.to_string() });
        Ok(())
    }

    /// Finish the drag gesture on `id`.
    pub fn end_drag(&mut self, id: &str) -> Result<(), SurfaceError> {
        if self.dragging.as_deref() == Some(id) {
            self.dragging = None;
        }
        self.events.push(WorkspaceEvent::DragEnd { node_id: id.to_string() });
        Ok(())
    }

    pub fn dragging(&self) -> Option<&str> {
        self.dragging.as_deref()
    }

    pub fn select(&mut self, id: Option<&str>) {
        self.events.push(WorkspaceEvent::Selected {
            node_id: id.map(str::to_string),
        });
    }

    /// Parent node and slot that currently hold `id`.
    pub fn parent_of(&self, id: &str) -> Option<(&str, &str)> {
        self.nodes.values().find_map(|n| {
            n.links
                .iter()
                .find(|(_, target)| target.as_str() == id)
                .map(|(slot, _)| (n.id.as_str(), slot.as_str()))
        })
    }

    fn require(&self, id: &str) -> Result<&GraphNode, SurfaceError> {
        self.nodes
            .get(id)
            .ok_or_else(|| SurfaceError::NodeNotFound(id.to_string()))
    }

    fn require_mut(&mut self, id: &str) -> Result<&mut GraphNode, SurfaceError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| SurfaceError::NodeNotFound(id.to_string()))
    }

    /// Whether `needle` is reachable from `root` through slot links.
    fn reaches(&self, root: &str, needle: &str) -> bool {
        let mut stack = vec![root];
        let mut seen = std::collections::HashSet::new();
        while let Some(current) = stack.pop() {
            if current == needle {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(current) {
                stack.extend(node.links.values().map(String::as_str));
            }
        }
        false
    }

    fn unplug(&mut self, target: &str) -> Vec<String> {
        let mut parents = Vec::new();
        for node in self.nodes.values_mut() {
            let before = node.links.len();
            node.links.retain(|_, linked| linked != target);
            if node.links.len() != before {
                parents.push(node.id.clone());
            }
        }
        parents
    }
}

impl EditorSurface for BlockWorkspace {
    fn create_node(&mut self, block_type: &str, id: &str) -> Result<(), SurfaceError> {
        if self.nodes.contains_key(id) {
            return Err(SurfaceError::DuplicateNode(id.to_string()));
        }
        self.nodes.insert(id.to_string(), GraphNode::new(id, block_type));
        self.events.push(WorkspaceEvent::Create { node_id: id.to_string() });
        Ok(())
    }

    fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    fn delete_node(&mut self, id: &str) -> Result<(), SurfaceError> {
        self.nodes
            .remove(id)
            .ok_or_else(|| SurfaceError::NodeNotFound(id.to_string()))?;
        if self.dragging.as_deref() == Some(id) {
            self.dragging = None;
        }
        for parent in self.unplug(id) {
            self.events.push(WorkspaceEvent::Move { node_id: parent });
        }
        self.events.push(WorkspaceEvent::Delete { node_id: id.to_string() });
        Ok(())
    }

    fn move_node(&mut self, id: &str, dx: f64, dy: f64) -> Result<(), SurfaceError> {
        if dx == 0.0 && dy == 0.0 {
            self.require(id)?;
            return Ok(());
        }
        let node = self.require_mut(id)?;
        node.position.x += dx;
        node.position.y += dy;
        self.events.push(WorkspaceEvent::Move { node_id: id.to_string() });
        Ok(())
    }

    fn move_node_to(&mut self, id: &str, position: Position) -> Result<(), SurfaceError> {
        let node = self.require_mut(id)?;
        if node.position == position {
            return Ok(());
        }
        node.position = position;
        self.events.push(WorkspaceEvent::Move { node_id: id.to_string() });
        Ok(())
    }

    fn set_field(&mut self, id: &str, name: &str, value: FieldValue) -> Result<(), SurfaceError> {
        let node = self.require_mut(id)?;
        if node.fields.get(name) == Some(&value) {
            return Ok(());
        }
        node.fields.insert(name.to_string(), value);
        self.events.push(WorkspaceEvent::Change {
            node_id: id.to_string(),
            target: ChangeTarget::Field(name.to_string()),
        });
        Ok(())
    }

    fn set_flags(&mut self, id: &str, flags: BlockFlags) -> Result<(), SurfaceError> {
        let node = self.require_mut(id)?;
        if node.flags == flags {
            return Ok(());
        }
        node.flags = flags;
        self.events.push(WorkspaceEvent::Change {
            node_id: id.to_string(),
            target: ChangeTarget::Flags,
        });
        Ok(())
    }

    fn connect_slot(&mut self, id: &str, slot: &str, target: Option<&str>) -> Result<(), SurfaceError> {
        let current = self.require(id)?.linked(slot).map(str::to_string);
        if current.as_deref() == target {
            return Ok(());
        }

        let Some(target) = target else {
            self.require_mut(id)?.links.remove(slot);
            self.events.push(WorkspaceEvent::Move { node_id: id.to_string() });
            return Ok(());
        };

        if target == id {
            return Err(SurfaceError::SelfConnection(id.to_string()));
        }
        self.require(target)?;
        if self.reaches(target, id) {
            return Err(SurfaceError::WouldCycle {
                node: id.to_string(),
                target: target.to_string(),
            });
        }

        // A block sits in at most one slot.
        for parent in self.unplug(target) {
            if parent != id {
                self.events.push(WorkspaceEvent::Move { node_id: parent });
            }
        }
        self.require_mut(id)?
            .links
            .insert(slot.to_string(), target.to_string());
        self.events.push(WorkspaceEvent::Move { node_id: id.to_string() });
        Ok(())
    }

    fn variables(&self) -> Vec<VariableRecord> {
        self.variables.values().cloned().collect()
    }

    fn create_variable(&mut self, variable: VariableRecord) -> Result<(), SurfaceError> {
        if self.variables.contains_key(&variable.id) {
            return Err(SurfaceError::DuplicateVariable(variable.id));
        }
        let var_id = variable.id.clone();
        self.variables.insert(var_id.clone(), variable);
        self.events.push(WorkspaceEvent::VarCreate { var_id });
        Ok(())
    }

    fn rename_variable(&mut self, id: &str, name: &str) -> Result<(), SurfaceError> {
        let variable = self
            .variables
            .get_mut(id)
            .ok_or_else(|| SurfaceError::VariableNotFound(id.to_string()))?;
        if variable.name == name {
            return Ok(());
        }
        variable.name = name.to_string();
        self.events.push(WorkspaceEvent::VarRename { var_id: id.to_string() });
        Ok(())
    }

    fn delete_variable(&mut self, id: &str) -> Result<(), SurfaceError> {
        self.variables
            .remove(id)
            .ok_or_else(|| SurfaceError::VariableNotFound(id.to_string()))?;
        self.events.push(WorkspaceEvent::VarDelete { var_id: id.to_string() });
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<WorkspaceEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NEXT_SLOT;

    fn workspace_with(ids: &[&str]) -> BlockWorkspace {
        let mut ws = BlockWorkspace::new();
        for id in ids {
            ws.create_node("text_print", id).unwrap();
        }
        ws.drain_events();
        ws
    }

    #[test]
    fn test_create_and_duplicate() {
        let mut ws = BlockWorkspace::new();
        ws.create_node("math_number", "b1").unwrap();
        assert_eq!(
            ws.create_node("math_number", "b1"),
            Err(SurfaceError::DuplicateNode("b1".into()))
        );
        assert_eq!(
            ws.drain_events(),
            vec![WorkspaceEvent::Create { node_id: "b1".into() }]
        );
    }

    #[test]
    fn test_noop_writes_emit_nothing() {
        let mut ws = workspace_with(&["b1"]);
        ws.set_field("b1", "NUM", FieldValue::Number(5.0)).unwrap();
        ws.drain_events();

        ws.set_field("b1", "NUM", FieldValue::Number(5.0)).unwrap();
        ws.move_node("b1", 0.0, 0.0).unwrap();
        ws.move_node_to("b1", Position::default()).unwrap();
        ws.set_flags("b1", BlockFlags::default()).unwrap();
        ws.connect_slot("b1", NEXT_SLOT, None).unwrap();
        assert_eq!(ws.pending_events(), 0);
    }

    #[test]
    fn test_move_relative_and_absolute() {
        let mut ws = workspace_with(&["b1"]);
        ws.move_node("b1", 50.0, 60.0).unwrap();
        ws.move_node_to("b1", Position::new(200.0, 60.0)).unwrap();
        assert_eq!(ws.node("b1").unwrap().position, Position::new(200.0, 60.0));
        assert_eq!(ws.drain_events().len(), 2);
    }

    #[test]
    fn test_connect_steals_from_previous_parent() {
        let mut ws = workspace_with(&["a", "b", "c"]);
        ws.connect_slot("a", NEXT_SLOT, Some("c")).unwrap();
        ws.connect_slot("b", "DO", Some("c")).unwrap();

        assert!(ws.node("a").unwrap().linked(NEXT_SLOT).is_none());
        assert_eq!(ws.node("b").unwrap().linked("DO"), Some("c"));
        assert_eq!(ws.parent_of("c"), Some(("b", "DO")));
    }

    #[test]
    fn test_connect_rejects_self_and_cycles() {
        let mut ws = workspace_with(&["a", "b"]);
        assert_eq!(
            ws.connect_slot("a", NEXT_SLOT, Some("a")),
            Err(SurfaceError::SelfConnection("a".into()))
        );
        ws.connect_slot("a", NEXT_SLOT, Some("b")).unwrap();
        assert!(matches!(
            ws.connect_slot("b", NEXT_SLOT, Some("a")),
            Err(SurfaceError::WouldCycle { .. })
        ));
    }

    #[test]
    fn test_connect_missing_target() {
        let mut ws = workspace_with(&["a"]);
        assert_eq!(
            ws.connect_slot("a", NEXT_SLOT, Some("ghost")),
            Err(SurfaceError::NodeNotFound("ghost".into()))
        );
    }

    #[test]
    fn test_delete_unplugs_parents() {
        let mut ws = workspace_with(&["a", "b"]);
        ws.connect_slot("a", NEXT_SLOT, Some("b")).unwrap();
        ws.drain_events();

        ws.delete_node("b").unwrap();
        assert!(ws.node("a").unwrap().links.is_empty());
        assert_eq!(
            ws.drain_events(),
            vec![
                WorkspaceEvent::Move { node_id: "a".into() },
                WorkspaceEvent::Delete { node_id: "b".into() },
            ]
        );
    }

    #[test]
    fn test_variables_lifecycle() {
        let mut ws = BlockWorkspace::new();
        ws.create_variable(VariableRecord::new("v1", "count", "")).unwrap();
        ws.rename_variable("v1", "total").unwrap();
        assert_eq!(ws.variables()[0].name, "total");
        ws.delete_variable("v1").unwrap();
        assert!(ws.variables().is_empty());
        assert_eq!(
            ws.rename_variable("v1", "x"),
            Err(SurfaceError::VariableNotFound("v1".into()))
        );
        assert_eq!(ws.drain_events().len(), 3);
    }

    #[test]
    fn test_drag_gesture_events() {
        let mut ws = workspace_with(&["b1"]);
        ws.begin_drag("b1").unwrap();
        assert_eq!(ws.dragging(), Some("b1"));
        ws.end_drag("b1").unwrap();
        assert!(ws.dragging().is_none());
        assert_eq!(
            ws.drain_events(),
            vec![
                WorkspaceEvent::DragStart { node_id: "b1".into() },
                WorkspaceEvent::DragEnd { node_id: "b1".into() },
            ]
        );
    }
}
