//! Drag Coordinator: gesture state machine guarding sync during a drag.

/// Current gesture state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DragState {
    #[default]
    Idle,
    Dragging(String),
}

/// Returned when a drag ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DragRelease {
    pub node_id: String,
    /// A remote change to the node arrived mid-drag and still has to be applied.
    pub deferred_remote: bool,
}

#[derive(Debug, Default)]
pub struct DragCoordinator {
    state: DragState,
    deferred: bool,
}

impl DragCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &DragState {
        &self.state
    }

    pub fn dragging(&self) -> Option<&str> {
        match &self.state {
            DragState::Dragging(id) => Some(id),
            DragState::Idle => None,
        }
    }

    pub fn is_dragging(&self, id: &str) -> bool {
        self.dragging() == Some(id)
    }

    /// `Idle -> Dragging(id)`. A drag already in progress on another node is
    /// released and returned so the caller can settle it.
    pub fn begin(&mut self, id: &str) -> Option<DragRelease> {
        if self.is_dragging(id) {
            return None;
        }
        let previous = self.release();
        self.state = DragState::Dragging(id.to_string());
        log::trace!("Drag started on {id}");
        previous
    }

    /// `Dragging(id) -> Idle`. Ending a drag that is not in progress is a no-op.
    pub fn end(&mut self, id: &str) -> Option<DragRelease> {
        if !self.is_dragging(id) {
            return None;
        }
        self.release()
    }

    /// Record that a remote change to `id` was held back. Returns `false`
    /// when `id` is not being dragged.
    pub fn defer(&mut self, id: &str) -> bool {
        if !self.is_dragging(id) {
            return false;
        }
        self.deferred = true;
        true
    }

    /// Drop the gesture without a release, e.g. when its node is deleted.
    pub fn forget(&mut self, id: &str) {
        if self.is_dragging(id) {
            self.state = DragState::Idle;
            self.deferred = false;
        }
    }

    fn release(&mut self) -> Option<DragRelease> {
        let DragState::Dragging(node_id) = std::mem::take(&mut self.state) else {
            return None;
        };
        let deferred_remote = std::mem::take(&mut self.deferred);
        log::trace!("Drag ended on {node_id} (deferred remote: {deferred_remote})");
        Some(DragRelease {
            node_id,
            deferred_remote,
        })
    }
}
