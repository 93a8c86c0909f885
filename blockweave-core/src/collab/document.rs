//! Replicated document seam and its yrs implementation.
//!
//! Two Y.Maps live in one `yrs::Doc`: `blocks` (node id -> record JSON) and
//! `variables` (variable id -> variable JSON). Each map is last-writer-wins
//! per key. Every write runs in a transaction whose origin is the writer's
//! [`SessionTag`], which map observers copy into the queued [`DocChange`].

use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use yrs::types::EntryChange;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, Map, MapRef, Observable, Out, ReadTxn, StateVector, Subscription, Transact,
    TransactionMut, Update,
};

use super::SessionTag;
use crate::codec::Record;
use crate::VariableRecord;

const BLOCKS_MAP: &str = "blocks";
const VARIABLES_MAP: &str = "variables";

/// Origin attached to updates received from the network.
pub const REMOTE_ORIGIN: &str = "remote";

#[derive(Error, Debug)]
pub enum DocError {
    #[error("malformed entry {key}: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("entry {0} is not a string")]
    NotText(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKind {
    Blocks,
    Variables,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Added,
    Updated,
    Removed,
}

/// One key touched by one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct DocChange {
    pub map: MapKind,
    pub key: String,
    pub action: ChangeAction,
    pub origin: Option<String>,
}

impl DocChange {
    pub fn is_from(&self, tag: &SessionTag) -> bool {
        tag.matches(self.origin.as_deref())
    }
}

/// Key/value maps replicated across peers.
pub trait ReplicatedDocument {
    /// Start queueing changes for [`take_changes`](Self::take_changes).
    fn subscribe(&mut self) -> Result<(), DocError>;

    /// Remove every observer. Idempotent.
    fn unsubscribe(&mut self);

    fn take_changes(&mut self) -> Vec<DocChange>;

    fn block(&self, id: &str) -> Result<Option<Record>, DocError>;

    /// Every well-formed record. Malformed entries are logged and skipped.
    fn blocks(&self) -> Vec<Record>;

    fn block_count(&self) -> usize;

    fn set_block(&mut self, record: &Record, origin: &SessionTag) -> Result<(), DocError>;

    /// Write several records in one transaction.
    fn set_blocks(&mut self, records: &[Record], origin: &SessionTag) -> Result<(), DocError>;

    /// Returns whether the key existed.
    fn delete_block(&mut self, id: &str, origin: &SessionTag) -> Result<bool, DocError>;

    fn variables(&self) -> Vec<VariableRecord>;

    /// Make the variables map hold exactly `variables`.
    fn replace_variables(
        &mut self,
        variables: &[VariableRecord],
        origin: &SessionTag,
    ) -> Result<(), DocError>;
}

type Queue<T> = Arc<Mutex<Vec<T>>>;

pub struct YrsDocument {
    doc: Doc,
    blocks: MapRef,
    variables: MapRef,
    changes: Queue<DocChange>,
    local_updates: Queue<Vec<u8>>,
    map_subscriptions: Vec<Subscription>,
    _update_subscription: Option<Subscription>,
}

impl YrsDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let blocks = doc.get_or_insert_map(BLOCKS_MAP);
        let variables = doc.get_or_insert_map(VARIABLES_MAP);
        let local_updates: Queue<Vec<u8>> = Arc::default();

        let sink = local_updates.clone();
        let update_subscription = doc
            .observe_update_v1(move |txn, event| {
                if origin_label(txn).as_deref() == Some(REMOTE_ORIGIN) {
                    return;
                }
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(event.update.clone());
            })
            .map_err(|e| log::error!("Failed to observe local updates: {e}"))
            .ok();

        Self {
            doc,
            blocks,
            variables,
            changes: Arc::default(),
            local_updates,
            map_subscriptions: Vec::new(),
            _update_subscription: update_subscription,
        }
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything this replica holds that `remote_state_vector` lacks.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| DocError::InvalidUpdate(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge an update received from a peer. Map observers see it with
    /// [`REMOTE_ORIGIN`], so the engine treats it as remote.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<(), DocError> {
        self.apply_update_with(update, REMOTE_ORIGIN)
    }

    pub fn apply_update_with(&self, update: &[u8], origin: &str) -> Result<(), DocError> {
        let update =
            Update::decode_v1(update).map_err(|e| DocError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin);
        txn.apply_update(update)
            .map_err(|e| DocError::InvalidUpdate(e.to_string()))
    }

    /// Updates produced by local transactions since the last call, ready to
    /// be sent to peers.
    pub fn take_local_updates(&self) -> Vec<Vec<u8>> {
        std::mem::take(
            &mut *self
                .local_updates
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn is_subscribed(&self) -> bool {
        !self.map_subscriptions.is_empty()
    }

    fn read_text<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Result<Option<String>, DocError> {
        match map.get(txn, key) {
            None => Ok(None),
            Some(Out::Any(Any::String(text))) => Ok(Some(text.to_string())),
            Some(_) => Err(DocError::NotText(key.to_string())),
        }
    }

    fn insert_if_changed(
        map: &MapRef,
        txn: &mut TransactionMut,
        key: &str,
        json: String,
    ) -> bool {
        if Self::read_text(map, &*txn, key).ok().flatten().as_deref() == Some(json.as_str()) {
            return false;
        }
        map.insert(txn, key, json);
        true
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn origin_label(txn: &TransactionMut) -> Option<String> {
    txn.origin()
        .map(|origin| String::from_utf8_lossy(origin.as_ref()).into_owned())
}

fn observe_map(map: &MapRef, kind: MapKind, sink: Queue<DocChange>) -> Subscription {
    map.observe(move |txn, event| {
        let origin = origin_label(txn);
        let mut queue = sink.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, change) in event.keys(txn).iter() {
            let action = match change {
                EntryChange::Inserted(_) => ChangeAction::Added,
                EntryChange::Updated(_, _) => ChangeAction::Updated,
                EntryChange::Removed(_) => ChangeAction::Removed,
            };
            queue.push(DocChange {
                map: kind,
                key: key.to_string(),
                action,
                origin: origin.clone(),
            });
        }
    })
}

impl ReplicatedDocument for YrsDocument {
    fn subscribe(&mut self) -> Result<(), DocError> {
        if self.is_subscribed() {
            return Ok(());
        }
        self.map_subscriptions = vec![
            observe_map(&self.blocks, MapKind::Blocks, self.changes.clone()),
            observe_map(&self.variables, MapKind::Variables, self.changes.clone()),
        ];
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.map_subscriptions.clear();
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn take_changes(&mut self) -> Vec<DocChange> {
        std::mem::take(&mut *self.changes.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn block(&self, id: &str) -> Result<Option<Record>, DocError> {
        let txn = self.doc.transact();
        let Some(json) = Self::read_text(&self.blocks, &txn, id)? else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|source| DocError::Malformed {
                key: id.to_string(),
                source,
            })
    }

    fn blocks(&self) -> Vec<Record> {
        let txn = self.doc.transact();
        let mut records = Vec::new();
        for (key, value) in self.blocks.iter(&txn) {
            let Out::Any(Any::String(json)) = value else {
                log::warn!("Skipping non-text block entry {key}");
                continue;
            };
            match serde_json::from_str::<Record>(&json) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Skipping malformed block record {key}: {e}"),
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    fn block_count(&self) -> usize {
        let txn = self.doc.transact();
        self.blocks.len(&txn) as usize
    }

    fn set_block(&mut self, record: &Record, origin: &SessionTag) -> Result<(), DocError> {
        self.set_blocks(std::slice::from_ref(record), origin)
    }

    fn set_blocks(&mut self, records: &[Record], origin: &SessionTag) -> Result<(), DocError> {
        let encoded = records
            .iter()
            .map(|r| serde_json::to_string(r).map(|json| (r.id.as_str(), json)))
            .collect::<Result<Vec<_>, _>>()?;
        let mut txn = self.doc.transact_mut_with(origin.as_str());
        for (key, json) in encoded {
            Self::insert_if_changed(&self.blocks, &mut txn, key, json);
        }
        Ok(())
    }

    fn delete_block(&mut self, id: &str, origin: &SessionTag) -> Result<bool, DocError> {
        let mut txn = self.doc.transact_mut_with(origin.as_str());
        Ok(self.blocks.remove(&mut txn, id).is_some())
    }

    fn variables(&self) -> Vec<VariableRecord> {
        let txn = self.doc.transact();
        let mut variables: Vec<VariableRecord> = self
            .variables
            .iter(&txn)
            .filter_map(|(key, value)| match value {
                Out::Any(Any::String(json)) => serde_json::from_str(&json)
                    .map_err(|e| log::warn!("Skipping malformed variable {key}: {e}"))
                    .ok(),
                _ => None,
            })
            .collect();
        variables.sort_by(|a, b| a.id.cmp(&b.id));
        variables
    }

    fn replace_variables(
        &mut self,
        variables: &[VariableRecord],
        origin: &SessionTag,
    ) -> Result<(), DocError> {
        let encoded = variables
            .iter()
            .map(|v| serde_json::to_string(v).map(|json| (v.id.as_str(), json)))
            .collect::<Result<Vec<_>, _>>()?;
        let mut txn = self.doc.transact_mut_with(origin.as_str());
        let stale: Vec<String> = self
            .variables
            .keys(&txn)
            .filter(|key| !encoded.iter().any(|(id, _)| id == key))
            .map(str::to_string)
            .collect();
        for key in stale {
            self.variables.remove(&mut txn, &key);
        }
        for (key, json) in encoded {
            Self::insert_if_changed(&self.variables, &mut txn, key, json);
        }
        Ok(())
    }
}
