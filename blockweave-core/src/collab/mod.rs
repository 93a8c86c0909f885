//! Sync engine between an [`EditorSurface`] and a [`ReplicatedDocument`].
//!
//! The engine is single-threaded and pull-based. The host mutates the
//! surface, then calls [`SyncEngine::pump`], which:
//!
//! 1. drains the surface's change feed into [`OutboundSync`],
//! 2. writes pending local edits to nodes a peer has just changed, then
//!    drains the document's change queue into [`InboundApply`] under the
//!    re-entrancy guard, discarding the surface events that apply produced,
//! 3. writes every node whose debounce window has expired.
//!
//! Every write carries this session's [`SessionTag`] as its transaction
//! origin, so the document observer can tell our own writes from a peer's.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

pub mod cache;
pub mod document;
pub mod drag;
pub mod inbound;
pub mod outbound;
pub mod scheduler;

pub use cache::RecordCache;
pub use document::{
    ChangeAction, DocChange, DocError, MapKind, ReplicatedDocument, YrsDocument, REMOTE_ORIGIN,
};
pub use drag::{DragCoordinator, DragRelease, DragState};
pub use inbound::InboundApply;
pub use outbound::OutboundSync;
pub use scheduler::{Clock, DebounceScheduler, ManualClock, SystemClock};

use crate::codec::{decode, encode, Record};
use crate::snapshot::{import_snapshot, SnapshotError, WorkspaceSnapshot};
use crate::workspace::{EditorSurface, WorkspaceEvent};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Document(#[from] DocError),
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] SnapshotError),
    #[error("sync engine already started")]
    AlreadyStarted,
    #[error("sync engine has been disposed")]
    Disposed,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period before a node's pending changes are written.
    pub debounce: Duration,
    /// How long a written record is remembered for duplicate suppression.
    pub record_cache_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(40),
            record_cache_ttl: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(10),
            ..Self::default()
        }
    }
}

/// Origin marker identifying one session's writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionTag(String);

impl SessionTag {
    pub const PREFIX: &'static str = "session:";

    pub fn new() -> Self {
        Self::from_peer(Uuid::new_v4())
    }

    pub fn from_peer(peer_id: Uuid) -> Self {
        Self(format!("{}{peer_id}", Self::PREFIX))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, origin: Option<&str>) -> bool {
        origin == Some(self.0.as_str())
    }
}

impl Default for SessionTag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session-scoped state shared by the outbound and inbound halves.
pub struct SyncContext {
    pub(crate) tag: SessionTag,
    pub(crate) config: SyncConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) drag: DragCoordinator,
    pub(crate) cache: RecordCache,
    applying_remote: bool,
}

impl SyncContext {
    pub fn new(tag: SessionTag, config: SyncConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: RecordCache::new(config.record_cache_ttl),
            tag,
            config,
            clock,
            drag: DragCoordinator::new(),
            applying_remote: false,
        }
    }

    pub fn tag(&self) -> &SessionTag {
        &self.tag
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn drag(&self) -> &DragCoordinator {
        &self.drag
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// True while remote state is being written into the surface.
    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote
    }
}

/// Counters for one [`SyncEngine::pump`] (or start/flush) call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub local_events: usize,
    pub writes: usize,
    pub deletes: usize,
    pub variable_syncs: usize,
    /// Writes skipped because the record matched the last one written.
    pub unchanged: usize,
    pub drag_suppressed: usize,
    pub echoes_suppressed: usize,
    /// Document changes dropped because this session made them.
    pub ignored_local: usize,
    pub applied: usize,
    pub removed: usize,
    pub deferred: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub failed: usize,
}

impl PumpReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// How [`SyncEngine::start`] initialised the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// The document was empty and was filled from the surface.
    Seeded { blocks: usize },
    /// The surface was replaced with the document's content.
    Loaded { blocks: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Disposed,
}

pub struct SyncEngine<S, D> {
    surface: S,
    doc: D,
    ctx: SyncContext,
    outbound: OutboundSync,
    inbound: InboundApply,
    lifecycle: Lifecycle,
}

impl<S: EditorSurface, D: ReplicatedDocument> SyncEngine<S, D> {
    pub fn new(surface: S, doc: D, tag: SessionTag, config: SyncConfig) -> Self {
        Self::with_clock(surface, doc, tag, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        surface: S,
        doc: D,
        tag: SessionTag,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            outbound: OutboundSync::new(config.debounce),
            inbound: InboundApply::new(),
            ctx: SyncContext::new(tag, config, clock),
            surface,
            doc,
            lifecycle: Lifecycle::Created,
        }
    }

    /// Subscribe to the document and bring both sides in line.
    ///
    /// An empty document is seeded from the surface, after importing
    /// `bootstrap` into an empty surface. Otherwise the document is
    /// authoritative and the surface is loaded from it.
    pub fn start(&mut self, bootstrap: Option<&WorkspaceSnapshot>) -> Result<StartMode, SyncError> {
        match self.lifecycle {
            Lifecycle::Running => return Err(SyncError::AlreadyStarted),
            Lifecycle::Disposed => return Err(SyncError::Disposed),
            Lifecycle::Created => {}
        }

        self.doc.subscribe()?;
        let mode = if self.doc.block_count() == 0 {
            self.seed(bootstrap)?
        } else {
            self.load()
        };
        self.lifecycle = Lifecycle::Running;
        log::info!("Sync engine {} started: {mode:?}", self.ctx.tag);
        Ok(mode)
    }

    fn seed(&mut self, bootstrap: Option<&WorkspaceSnapshot>) -> Result<StartMode, SyncError> {
        if let Some(snapshot) = bootstrap {
            if self.surface.node_ids().is_empty() {
                let created = import_snapshot(snapshot, &mut self.surface)?;
                log::info!("Imported {} blocks from bootstrap snapshot", created.len());
            } else {
                log::warn!("Surface already holds blocks; bootstrap snapshot ignored");
            }
        }
        self.surface.drain_events();

        let records: Vec<Record> = self
            .surface
            .node_ids()
            .iter()
            .filter_map(|id| self.surface.node(id))
            .map(encode)
            .collect();
        if !records.is_empty() {
            self.doc.set_blocks(&records, &self.ctx.tag)?;
        }
        let variables = self.surface.variables();
        if !variables.is_empty() {
            self.doc.replace_variables(&variables, &self.ctx.tag)?;
        }

        let now = self.ctx.now();
        let blocks = records.len();
        for record in records {
            self.ctx.cache.store(record, now);
        }
        Ok(StartMode::Seeded { blocks })
    }

    fn load(&mut self) -> StartMode {
        let mut report = PumpReport::default();
        self.ctx.applying_remote = true;
        let blocks = self
            .inbound
            .load_all(&mut self.surface, &self.doc, &self.outbound, &mut report);
        self.surface.drain_events();
        self.ctx.applying_remote = false;
        if report.failed > 0 {
            log::warn!("{} records could not be loaded", report.failed);
        }
        StartMode::Loaded { blocks }
    }

    /// Run one sync cycle. A no-op unless the engine is running.
    pub fn pump(&mut self) -> PumpReport {
        let mut report = PumpReport::default();
        if self.lifecycle != Lifecycle::Running {
            return report;
        }

        let events = self.surface.drain_events();
        report.local_events = events.len();
        self.route_local(events, &mut report);

        let changes = self.doc.take_changes();
        if !changes.is_empty() {
            self.flush_contested(&changes, &mut report);
            self.ctx.applying_remote = true;
            self.inbound.apply(
                changes,
                &mut self.ctx,
                &mut self.surface,
                &self.doc,
                &self.outbound,
                &mut report,
            );
            self.discard_echoes(&mut report);
            self.ctx.applying_remote = false;
        }

        self.outbound
            .flush_due(&mut self.ctx, &self.surface, &mut self.doc, &mut report);

        if report.failed > 0 {
            log::warn!("Sync cycle finished with {} failures", report.failed);
        }
        report
    }

    /// Route local events in order. Drag boundaries split the batch so that
    /// events before a drag start are handled before the gesture guard is up.
    fn route_local(&mut self, events: Vec<WorkspaceEvent>, report: &mut PumpReport) {
        let mut batch = Vec::new();
        for event in events {
            match event {
                WorkspaceEvent::DragStart { node_id } => {
                    self.handle_batch(&mut batch, report);
                    if let Some(previous) = self.ctx.drag.begin(&node_id) {
                        self.settle_drag(previous, report);
                    }
                    self.outbound.cancel(&node_id);
                }
                WorkspaceEvent::DragEnd { node_id } => {
                    self.handle_batch(&mut batch, report);
                    if let Some(release) = self.ctx.drag.end(&node_id) {
                        self.settle_drag(release, report);
                    }
                }
                other => batch.push(other),
            }
        }
        self.handle_batch(&mut batch, report);
    }

    fn handle_batch(&mut self, batch: &mut Vec<WorkspaceEvent>, report: &mut PumpReport) {
        self.outbound
            .handle_events(&batch[..], &mut self.ctx, &self.surface, &mut self.doc, report);
        batch.clear();
    }

    /// Write local edits still inside their debounce window for nodes a
    /// peer has just changed. The remote apply then reads them back instead
    /// of overwriting them.
    fn flush_contested(&mut self, changes: &[DocChange], report: &mut PumpReport) {
        for change in changes {
            if change.map != MapKind::Blocks
                || change.is_from(&self.ctx.tag)
                || !self.outbound.is_pending(&change.key)
            {
                continue;
            }
            log::debug!("Writing pending local edit to {} ahead of a remote change", change.key);
            self.outbound
                .flush_node(&change.key, &mut self.ctx, &self.surface, &mut self.doc, report);
        }
    }

    fn discard_echoes(&mut self, report: &mut PumpReport) {
        let echoes = self.surface.drain_events();
        self.outbound
            .handle_events(&echoes, &mut self.ctx, &self.surface, &mut self.doc, report);
    }

    /// Finish a drag: replay a held-back remote change, then write the
    /// node's final state once.
    fn settle_drag(&mut self, release: DragRelease, report: &mut PumpReport) {
        let id = release.node_id;
        if release.deferred_remote {
            self.replay_deferred(&id, report);
        }
        self.outbound
            .flush_node(&id, &mut self.ctx, &self.surface, &mut self.doc, report);
        if !release.deferred_remote && self.inbound.waiting_on(&id) > 0 {
            self.ctx.applying_remote = true;
            self.inbound
                .reconcile_waiting(&id, &mut self.surface, &self.doc, &self.outbound, report);
            self.discard_echoes(report);
            self.ctx.applying_remote = false;
        }
    }

    /// Apply the document's current record for `id`, keeping the position
    /// the user dropped the node at.
    fn replay_deferred(&mut self, id: &str, report: &mut PumpReport) {
        self.ctx.applying_remote = true;
        match self.doc.block(id) {
            Ok(Some(mut record)) => {
                if let Some(node) = self.surface.node(id) {
                    record.position = Some(node.position);
                }
                inbound::apply_record(&record, &mut self.surface, report);
            }
            Ok(None) => {
                if self.surface.node(id).is_some() {
                    match self.surface.delete_node(id) {
                        Ok(()) => report.removed += 1,
                        Err(e) => log::warn!("Failed to remove {id} after drag: {e}"),
                    }
                }
            }
            Err(e) => {
                log::warn!("Dropping deferred change to {id}: {e}");
                report.failed += 1;
            }
        }
        self.inbound
            .reconcile_all(Some(id), &mut self.surface, &self.doc, &self.outbound, report);
        self.discard_echoes(report);
        self.ctx.applying_remote = false;
    }

    /// Write everything still pending right away, settling an open drag
    /// first. Used before leaving a session.
    pub fn flush_pending(&mut self) -> PumpReport {
        let mut report = PumpReport::default();
        if self.lifecycle != Lifecycle::Running {
            return report;
        }
        let events = self.surface.drain_events();
        report.local_events = events.len();
        self.route_local(events, &mut report);

        if let Some(id) = self.ctx.drag.dragging().map(str::to_string) {
            if let Some(release) = self.ctx.drag.end(&id) {
                self.settle_drag(release, &mut report);
            }
        }
        self.outbound
            .flush_all(&mut self.ctx, &self.surface, &mut self.doc, &mut report);
        report
    }

    /// Unsubscribe from the document and drop all pending work. Later pumps
    /// do nothing.
    pub fn dispose(&mut self) {
        if self.lifecycle == Lifecycle::Disposed {
            return;
        }
        self.doc.unsubscribe();
        let cancelled = self.outbound.cancel_all();
        self.ctx.cache.clear();
        self.ctx.drag = DragCoordinator::new();
        self.ctx.applying_remote = false;
        self.lifecycle = Lifecycle::Disposed;
        log::info!(
            "Sync engine {} disposed ({cancelled} pending writes dropped)",
            self.ctx.tag
        );
    }

    /// Dispose and hand back the surface and document.
    pub fn into_parts(mut self) -> (S, D) {
        self.dispose();
        (self.surface, self.doc)
    }

    /// Re-apply a record to the surface outside the normal change feed,
    /// e.g. after the host reverted a node. Connections are reconciled.
    pub fn resync_node(&mut self, id: &str) -> Result<bool, SyncError> {
        let Some(record) = self.doc.block(id)? else {
            return Ok(false);
        };
        let mut report = PumpReport::default();
        self.ctx.applying_remote = true;
        let applied = decode(&record, &mut self.surface).is_ok();
        self.inbound.reconcile_all(
            self.ctx.drag.dragging(),
            &mut self.surface,
            &self.doc,
            &self.outbound,
            &mut report,
        );
        self.discard_echoes(&mut report);
        self.ctx.applying_remote = false;
        Ok(applied)
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }

    pub fn session_tag(&self) -> &SessionTag {
        &self.ctx.tag
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn dragging(&self) -> Option<&str> {
        self.ctx.drag.dragging()
    }

    pub fn pending_writes(&self) -> usize {
        self.outbound.pending_count()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.outbound.next_deadline()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn document(&self) -> &D {
        &self.doc
    }

    pub fn document_mut(&mut self) -> &mut D {
        &mut self.doc
    }
}
