//! Outbound Sync: surface events -> debounced, origin-tagged document writes.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use super::document::ReplicatedDocument;
use super::scheduler::DebounceScheduler;
use super::{PumpReport, SyncContext};
use crate::codec::encode;
use crate::workspace::{EditorSurface, WorkspaceEvent};

#[derive(Debug)]
pub struct OutboundSync {
    scheduler: DebounceScheduler<String>,
}

impl OutboundSync {
    pub fn new(debounce: Duration) -> Self {
        Self {
            scheduler: DebounceScheduler::new(debounce),
        }
    }

    /// Classify a batch of surface events.
    ///
    /// Create/change/move arm a per-node debounce, deletes hit the document
    /// at once, and any variable event resyncs the whole variable map once
    /// per batch. Drag events are routed by the engine and ignored here.
    /// While a remote apply is in progress every event is an echo and is
    /// dropped.
    pub fn handle_events<S, D>(
        &mut self,
        events: &[WorkspaceEvent],
        ctx: &mut SyncContext,
        surface: &S,
        doc: &mut D,
        report: &mut PumpReport,
    ) where
        S: EditorSurface + ?Sized,
        D: ReplicatedDocument + ?Sized,
    {
        if events.is_empty() {
            return;
        }
        if ctx.is_applying_remote() {
            log::trace!("Suppressing {} echo events", events.len());
            report.echoes_suppressed += events.len();
            return;
        }

        let now = ctx.now();
        let mut variables_dirty = false;
        for event in events {
            match event {
                WorkspaceEvent::Create { node_id }
                | WorkspaceEvent::Change { node_id, .. }
                | WorkspaceEvent::Move { node_id } => {
                    if ctx.drag.is_dragging(node_id) {
                        report.drag_suppressed += 1;
                        continue;
                    }
                    if self.scheduler.schedule(node_id.clone(), now) {
                        log::trace!("Write for {node_id} scheduled");
                    }
                }
                WorkspaceEvent::Delete { node_id } => self.delete(node_id, ctx, doc, report),
                WorkspaceEvent::VarCreate { .. }
                | WorkspaceEvent::VarRename { .. }
                | WorkspaceEvent::VarDelete { .. } => variables_dirty = true,
                WorkspaceEvent::DragStart { .. }
                | WorkspaceEvent::DragEnd { .. }
                | WorkspaceEvent::Selected { .. } => {}
            }
        }

        if variables_dirty {
            match doc.replace_variables(&surface.variables(), &ctx.tag) {
                Ok(()) => report.variable_syncs += 1,
                Err(e) => {
                    log::warn!("Failed to sync variables: {e}");
                    report.failed += 1;
                }
            }
        }
    }

    /// Write every node whose debounce window has expired.
    pub fn flush_due<S, D>(
        &mut self,
        ctx: &mut SyncContext,
        surface: &S,
        doc: &mut D,
        report: &mut PumpReport,
    ) where
        S: EditorSurface + ?Sized,
        D: ReplicatedDocument + ?Sized,
    {
        for id in self.scheduler.due(ctx.now()) {
            Self::write_node(&id, ctx, surface, doc, report);
        }
    }

    /// Write every pending node now, whatever its deadline.
    pub fn flush_all<S, D>(
        &mut self,
        ctx: &mut SyncContext,
        surface: &S,
        doc: &mut D,
        report: &mut PumpReport,
    ) where
        S: EditorSurface + ?Sized,
        D: ReplicatedDocument + ?Sized,
    {
        for id in self.scheduler.drain() {
            Self::write_node(&id, ctx, surface, doc, report);
        }
    }

    /// Write one node immediately, dropping its pending debounce.
    pub fn flush_node<S, D>(
        &mut self,
        id: &str,
        ctx: &mut SyncContext,
        surface: &S,
        doc: &mut D,
        report: &mut PumpReport,
    ) -> bool
    where
        S: EditorSurface + ?Sized,
        D: ReplicatedDocument + ?Sized,
    {
        self.scheduler.cancel(&id.to_string());
        Self::write_node(id, ctx, surface, doc, report)
    }

    pub fn cancel(&mut self, id: &str) -> bool {
        self.scheduler.cancel(&id.to_string())
    }

    pub fn cancel_all(&mut self) -> usize {
        self.scheduler.cancel_all()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.scheduler.is_pending(&id.to_string())
    }

    pub fn pending_ids(&self) -> HashSet<String> {
        self.scheduler.pending().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.scheduler.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    fn delete<D: ReplicatedDocument + ?Sized>(
        &mut self,
        id: &str,
        ctx: &mut SyncContext,
        doc: &mut D,
        report: &mut PumpReport,
    ) {
        self.cancel(id);
        ctx.cache.invalidate(id);
        ctx.drag.forget(id);
        match doc.delete_block(id, &ctx.tag) {
            Ok(true) => {
                log::debug!("Deleted {id} from document");
                report.deletes += 1;
            }
            Ok(false) => log::trace!("{id} was never written"),
            Err(e) => {
                log::warn!("Failed to delete {id}: {e}");
                report.failed += 1;
            }
        }
    }

    fn write_node<S, D>(
        id: &str,
        ctx: &mut SyncContext,
        surface: &S,
        doc: &mut D,
        report: &mut PumpReport,
    ) -> bool
    where
        S: EditorSurface + ?Sized,
        D: ReplicatedDocument + ?Sized,
    {
        let Some(node) = surface.node(id) else {
            log::trace!("{id} vanished before its write");
            return false;
        };
        let record = encode(node);
        let now = ctx.now();
        if ctx.cache.is_fresh(&record, now) {
            report.unchanged += 1;
            return false;
        }
        match doc.set_block(&record, &ctx.tag) {
            Ok(()) => {
                ctx.cache.store(record, now);
                report.writes += 1;
                true
            }
            Err(e) => {
                log::warn!("Failed to write {id}: {e}");
                report.failed += 1;
                false
            }
        }
    }
}
