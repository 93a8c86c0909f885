//! Inbound Apply: remote document changes -> editor surface.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::document::{DocChange, MapKind, ReplicatedDocument};
use super::outbound::OutboundSync;
use super::{PumpReport, SyncContext};
use crate::codec::{decode, Record};
use crate::reconcile::{reconcile, ReconcileReport};
use crate::workspace::EditorSurface;
use crate::VariableRecord;

#[derive(Debug, Default)]
pub struct InboundApply {
    batches: u64,
    /// Target id -> nodes whose record names it but could not be plugged in
    /// on the last pass.
    waiting: HashMap<String, HashSet<String>>,
}

impl InboundApply {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of remote batches applied so far.
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Nodes waiting for `target` to appear before a slot can be plugged.
    pub fn waiting_on(&self, target: &str) -> usize {
        self.waiting.get(target).map_or(0, HashSet::len)
    }

    /// Apply one batch of document changes. The caller holds the
    /// re-entrancy guard for the duration.
    ///
    /// Changes written by this session are dropped. Remaining keys are read
    /// fresh from the document, so several changes to one key collapse into
    /// a single apply. A key whose node is being dragged is deferred to the
    /// end of the drag.
    pub fn apply<S, D>(
        &mut self,
        changes: Vec<DocChange>,
        ctx: &mut SyncContext,
        surface: &mut S,
        doc: &D,
        outbound: &OutboundSync,
        report: &mut PumpReport,
    ) where
        S: EditorSurface + ?Sized,
        D: ReplicatedDocument + ?Sized,
    {
        let mut block_keys = BTreeSet::new();
        let mut variables_changed = false;
        for change in changes {
            if change.is_from(&ctx.tag) {
                report.ignored_local += 1;
                continue;
            }
            match change.map {
                MapKind::Blocks => {
                    block_keys.insert(change.key);
                }
                MapKind::Variables => variables_changed = true,
            }
        }
        if block_keys.is_empty() && !variables_changed {
            return;
        }

        self.batches += 1;
        log::debug!(
            "Applying remote batch: {} blocks, variables changed: {variables_changed}",
            block_keys.len()
        );

        if variables_changed {
            mirror_variables(surface, &doc.variables(), report);
        }

        // Deletes and type changes unplug these on the surface.
        let parents = linked_parents(surface, &block_keys);

        let mut touched = BTreeSet::new();
        for key in &block_keys {
            ctx.cache.invalidate(key);
            if ctx.drag.defer(key) {
                log::debug!("Holding remote change to {key} until its drag ends");
                report.deferred += 1;
                continue;
            }
            if apply_block(key, surface, doc, report) {
                touched.insert(key.clone());
            }
        }

        if !touched.is_empty() {
            let mut scope = self.waiting_for(&touched);
            scope.extend(parents);
            scope.extend(touched);
            let held = ctx.drag.dragging().map(str::to_string);
            self.reconcile_scope(scope, held.as_deref(), surface, doc, outbound, report);
        }
    }

    /// Replace the surface's content with the document's: every record is
    /// applied, local nodes the document lacks are removed, variables are
    /// mirrored and connections reconciled. Returns the number of records.
    pub fn load_all<S, D>(
        &mut self,
        surface: &mut S,
        doc: &D,
        outbound: &OutboundSync,
        report: &mut PumpReport,
    ) -> usize
    where
        S: EditorSurface + ?Sized,
        D: ReplicatedDocument + ?Sized,
    {
        let records = doc.blocks();
        mirror_variables(surface, &doc.variables(), report);

        for record in &records {
            apply_record(record, surface, report);
        }
        let known: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        for id in surface.node_ids() {
            if known.contains(id.as_str()) {
                continue;
            }
            match surface.delete_node(&id) {
                Ok(()) => report.removed += 1,
                Err(e) => log::warn!("Failed to drop local-only node {id}: {e}"),
            }
        }

        self.reconcile_all(None, surface, doc, outbound, report);
        records.len()
    }

    /// Run the connection pass over every record in the document.
    ///
    /// Nodes with a local write still pending are skipped: their local
    /// links are newer than what the document holds.
    pub fn reconcile_all<S, D>(
        &mut self,
        held: Option<&str>,
        surface: &mut S,
        doc: &D,
        outbound: &OutboundSync,
        report: &mut PumpReport,
    ) where
        S: EditorSurface + ?Sized,
        D: ReplicatedDocument + ?Sized,
    {
        let pending = outbound.pending_ids();
        let records: Vec<Record> = doc
            .blocks()
            .into_iter()
            .filter(|r| !pending.contains(&r.id))
            .collect();
        let result = reconcile(&records, surface, held);
        self.waiting.clear();
        self.track_waiting(&records, held, &result);
        tally(&result, report);
    }

    /// Retry the nodes that were waiting on `target`, e.g. once a drag of
    /// `target` has ended.
    pub fn reconcile_waiting<S, D>(
        &mut self,
        target: &str,
        surface: &mut S,
        doc: &D,
        outbound: &OutboundSync,
        report: &mut PumpReport,
    ) where
        S: EditorSurface + ?Sized,
        D: ReplicatedDocument + ?Sized,
    {
        let scope = self.waiting_for(&BTreeSet::from([target.to_string()]));
        if !scope.is_empty() {
            self.reconcile_scope(scope, None, surface, doc, outbound, report);
        }
    }

    fn waiting_for(&self, targets: &BTreeSet<String>) -> BTreeSet<String> {
        targets
            .iter()
            .filter_map(|target| self.waiting.get(target))
            .flatten()
            .cloned()
            .collect()
    }

    /// Reconcile the records of `scope` only.
    fn reconcile_scope<S, D>(
        &mut self,
        scope: BTreeSet<String>,
        held: Option<&str>,
        surface: &mut S,
        doc: &D,
        outbound: &OutboundSync,
        report: &mut PumpReport,
    ) where
        S: EditorSurface + ?Sized,
        D: ReplicatedDocument + ?Sized,
    {
        let records: Vec<Record> = scope
            .iter()
            .filter(|id| !outbound.is_pending(id))
            .filter_map(|id| match doc.block(id) {
                Ok(record) => record,
                Err(e) => {
                    log::debug!("Not reconciling {id}: {e}");
                    None
                }
            })
            .collect();
        log::trace!("Reconciling {} of {} records in scope", records.len(), scope.len());
        let result = reconcile(&records, surface, held);
        self.track_waiting(&records, held, &result);
        tally(&result, report);
    }

    /// Forget what the reconciled records were waiting on, then note what
    /// they still wait on.
    fn track_waiting(&mut self, records: &[Record], held: Option<&str>, result: &ReconcileReport) {
        let evaluated: HashSet<&str> = records
            .iter()
            .map(|r| r.id.as_str())
            .filter(|id| Some(*id) != held)
            .collect();
        self.waiting.retain(|_, nodes| {
            nodes.retain(|node| !evaluated.contains(node.as_str()));
            !nodes.is_empty()
        });
        for (node, _, target) in &result.deferred {
            self.waiting.entry(target.clone()).or_default().insert(node.clone());
        }
    }
}

fn tally(result: &ReconcileReport, report: &mut PumpReport) {
    report.connected += result.connected;
    report.disconnected += result.disconnected;
    report.failed += result.failed;
}

/// Nodes whose slots currently hold one of `targets`.
fn linked_parents<S>(surface: &S, targets: &BTreeSet<String>) -> BTreeSet<String>
where
    S: EditorSurface + ?Sized,
{
    surface
        .node_ids()
        .into_iter()
        .filter(|id| {
            surface
                .node(id)
                .is_some_and(|node| node.links.values().any(|target| targets.contains(target)))
        })
        .collect()
}

/// Returns whether the surface may have changed.
fn apply_block<S, D>(key: &str, surface: &mut S, doc: &D, report: &mut PumpReport) -> bool
where
    S: EditorSurface + ?Sized,
    D: ReplicatedDocument + ?Sized,
{
    match doc.block(key) {
        Ok(Some(record)) => apply_record(&record, surface, report),
        Ok(None) => {
            if surface.node(key).is_none() {
                return false;
            }
            match surface.delete_node(key) {
                Ok(()) => {
                    report.removed += 1;
                    true
                }
                Err(e) => {
                    log::warn!("Failed to remove {key}: {e}");
                    report.failed += 1;
                    false
                }
            }
        }
        Err(e) => {
            log::warn!("Skipping remote block {key}: {e}");
            report.failed += 1;
            false
        }
    }
}

pub(crate) fn apply_record<S>(record: &Record, surface: &mut S, report: &mut PumpReport) -> bool
where
    S: EditorSurface + ?Sized,
{
    match decode(record, surface) {
        Ok(_) => {
            report.applied += 1;
            true
        }
        Err(e) => {
            log::warn!("Skipping remote block {}: {e}", record.id);
            report.failed += 1;
            false
        }
    }
}

/// Make the surface's variable list equal `remote`.
fn mirror_variables<S>(surface: &mut S, remote: &[VariableRecord], report: &mut PumpReport)
where
    S: EditorSurface + ?Sized,
{
    let local = surface.variables();

    for variable in &local {
        if remote.iter().any(|r| r.id == variable.id) {
            continue;
        }
        if let Err(e) = surface.delete_variable(&variable.id) {
            log::warn!("Failed to delete variable {}: {e}", variable.id);
            report.failed += 1;
        }
    }

    for variable in remote {
        let result = match local.iter().find(|l| l.id == variable.id) {
            None => surface.create_variable(variable.clone()),
            Some(current) if current.var_type != variable.var_type => surface
                .delete_variable(&variable.id)
                .and_then(|()| surface.create_variable(variable.clone())),
            Some(current) if current.name != variable.name => {
                surface.rename_variable(&variable.id, &variable.name)
            }
            Some(_) => Ok(()),
        };
        if let Err(e) = result {
            log::warn!("Failed to mirror variable {}: {e}", variable.id);
            report.failed += 1;
        }
    }
}
