//! Second-pass restoration of slot connections.
//!
//! Peers create nodes in no particular order, so a record may name a target
//! this replica has not seen yet. Such slots are skipped and picked up by the
//! next pass; nothing is treated as an error.

use crate::codec::Record;
use crate::workspace::EditorSurface;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub connected: usize,
    pub disconnected: usize,
    /// `(node, slot, target)` triples whose target is not present yet.
    pub deferred: Vec<(String, String, String)>,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn changed(&self) -> usize {
        self.connected + self.disconnected
    }
}

/// Make every local node's slots match its record's `connections`.
///
/// Slots absent from a record are emptied. A slot naming a target that is
/// not present locally is left alone and reported as deferred. `held` names
/// a node under an in-progress gesture; it is neither rewired nor plugged
/// anywhere during this pass.
pub fn reconcile<'a, S, I>(records: I, surface: &mut S, held: Option<&str>) -> ReconcileReport
where
    S: EditorSurface + ?Sized,
    I: IntoIterator<Item = &'a Record>,
{
    let mut report = ReconcileReport::default();

    for record in records {
        if held == Some(record.id.as_str()) {
            continue;
        }
        let Some(node) = surface.node(&record.id) else {
            continue;
        };

        let stale: Vec<String> = node
            .links
            .keys()
            .filter(|slot| !record.connections.contains_key(*slot))
            .cloned()
            .collect();
        for slot in stale {
            match surface.connect_slot(&record.id, &slot, None) {
                Ok(()) => report.disconnected += 1,
                Err(e) => {
                    log::warn!("Failed to empty {}.{slot}: {e}", record.id);
                    report.failed += 1;
                }
            }
        }

        for (slot, target) in &record.connections {
            if held == Some(target.as_str()) || surface.node(target).is_none() {
                report
                    .deferred
                    .push((record.id.clone(), slot.clone(), target.clone()));
                continue;
            }
            let current = surface
                .node(&record.id)
                .and_then(|n| n.linked(slot))
                .map(str::to_string);
            if current.as_deref() == Some(target.as_str()) {
                continue;
            }
            match surface.connect_slot(&record.id, slot, Some(target)) {
                Ok(()) => report.connected += 1,
                Err(e) => {
                    log::warn!("Failed to connect {}.{slot} -> {target}: {e}", record.id);
                    report.failed += 1;
                }
            }
        }
    }

    if !report.deferred.is_empty() {
        log::debug!("{} connections waiting for their target", report.deferred.len());
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode;
    use crate::workspace::BlockWorkspace;
    use crate::NEXT_SLOT;

    fn record_with(id: &str, links: &[(&str, &str)]) -> Record {
        let mut record = Record::minimal(id, "controls_if");
        for (slot, target) in links {
            record.connections.insert(slot.to_string(), target.to_string());
        }
        record
    }

    #[test]
    fn test_missing_target_is_deferred_then_connected() {
        let mut ws = BlockWorkspace::new();
        let b2 = record_with("b2", &[("A", "b1")]);
        decode(&b2, &mut ws).unwrap();

        let report = reconcile([&b2], &mut ws, None);
        assert_eq!(report.connected, 0);
        assert_eq!(report.deferred, vec![("b2".into(), "A".into(), "b1".into())]);

        let b1 = Record::minimal("b1", "math_number");
        decode(&b1, &mut ws).unwrap();
        let report = reconcile([&b2, &b1], &mut ws, None);
        assert_eq!(report.connected, 1);
        assert!(report.deferred.is_empty());
        assert_eq!(ws.node("b2").unwrap().linked("A"), Some("b1"));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut ws = BlockWorkspace::new();
        let parent = record_with("p", &[(NEXT_SLOT, "c")]);
        let child = Record::minimal("c", "text_print");
        decode(&parent, &mut ws).unwrap();
        decode(&child, &mut ws).unwrap();

        assert_eq!(reconcile([&parent, &child], &mut ws, None).connected, 1);
        ws.drain_events();
        let again = reconcile([&parent, &child], &mut ws, None);
        assert_eq!(again.changed(), 0);
        assert!(ws.drain_events().is_empty());
    }

    #[test]
    fn test_slot_missing_from_record_is_emptied() {
        let mut ws = BlockWorkspace::new();
        ws.create_node("controls_if", "p").unwrap();
        ws.create_node("text_print", "c").unwrap();
        ws.connect_slot("p", "DO0", Some("c")).unwrap();

        let report = reconcile([&record_with("p", &[])], &mut ws, None);
        assert_eq!(report.disconnected, 1);
        assert!(ws.node("p").unwrap().links.is_empty());
    }

    #[test]
    fn test_held_node_is_untouched() {
        let mut ws = BlockWorkspace::new();
        ws.create_node("controls_if", "p").unwrap();
        ws.create_node("text_print", "c").unwrap();

        let parent = record_with("p", &[("DO0", "c")]);
        let report = reconcile([&parent], &mut ws, Some("c"));
        assert_eq!(report.connected, 0);
        assert_eq!(report.deferred.len(), 1);

        let report = reconcile([&parent], &mut ws, Some("p"));
        assert_eq!(report, ReconcileReport::default());
    }

    #[test]
    fn test_failed_connect_does_not_abort_pass() {
        let mut ws = BlockWorkspace::new();
        ws.create_node("controls_if", "a").unwrap();
        ws.create_node("controls_if", "b").unwrap();
        ws.create_node("controls_if", "c").unwrap();
        ws.connect_slot("a", NEXT_SLOT, Some("b")).unwrap();

        // b -> a closes a cycle; the pass still wires c.
        let bad = record_with("b", &[(NEXT_SLOT, "a")]);
        let good = record_with("c", &[("DO0", "a")]);
        let report = reconcile([&bad, &good], &mut ws, None);
        assert_eq!(report.failed, 1);
        assert_eq!(report.connected, 1);
        assert_eq!(ws.node("c").unwrap().linked("DO0"), Some("a"));
    }
}
