//! Undo and transaction history.

use super::commit::{normalize, obsoleted_by, StagedPickle, StagedRevision};
use super::{EngineState, FullStorage};
use crate::error::{CoreError, CoreResult};
use crate::kv::{self, TableId};
use crate::storage::{RevisionInfo, TransactionDescription, UndoFilter};
use crate::transaction::Transaction;
use crate::types::{Oid, Tid, VersionId};
use tracing::debug;

impl FullStorage {
    pub(super) fn undo_transaction(&self, tid: Tid, txn: &Transaction) -> CoreResult<Vec<Oid>> {
        self.ensure_writable()?;
        let resolver = self.resolver();
        let mut state = self.state.lock();
        state.tpc_for(txn)?;
        if tid <= state.pack_tid {
            return Err(CoreError::undo(format!(
                "transaction {tid} is not after the last pack time {}",
                state.pack_tid
            )));
        }
        if !state.kv.contains(TableId::TxnMetadata, &tid.to_bytes()) {
            return Err(CoreError::undo(format!("no transaction {tid}")));
        }

        let oids: Vec<Oid> = state
            .kv
            .prefix(TableId::TxnOids, &tid.to_bytes())
            .filter_map(|(key, _)| kv::key_part(key, 1).map(Oid::new))
            .collect();

        let mut staged = Vec::with_capacity(oids.len());
        for &oid in &oids {
            if state.is_pending(oid) {
                return Err(CoreError::undo(format!(
                    "{oid} was already modified in this transaction"
                )));
            }
            let undone = state
                .metadata(oid, tid)?
                .ok_or_else(|| CoreError::undo(format!("revision {tid} of {oid} is gone")))?;
            let previous = if undone.prevrevid.is_zero() {
                None
            } else {
                Some(state.metadata(oid, undone.prevrevid)?.ok_or_else(|| {
                    CoreError::undo(format!(
                        "previous revision {} of {oid} was packed away",
                        undone.prevrevid
                    ))
                })?)
            };
            let current = state.current(oid)?;
            let Some((current_tid, current_md)) = current else {
                return Err(CoreError::undo(format!("{oid} no longer exists")));
            };
            if current_md.in_version() && current_md.vid != undone.vid {
                return Err(CoreError::undo(format!(
                    "{oid} is locked in version {:?}",
                    state.version_name(current_md.vid)
                )));
            }

            let restored = match previous {
                Some(prev) if !prev.is_tombstone() => StagedPickle::Existing(prev.lrevid),
                _ => StagedPickle::Tombstone,
            };
            let (vid, nvrevid) = previous.map_or((VersionId::NON_VERSION, Tid::ZERO), |p| {
                (p.vid, p.nvrevid)
            });

            let pickle = if current_tid == tid || current_md.lrevid == undone.lrevid {
                restored
            } else {
                // the object changed since; only a merge can take the change out
                let StagedPickle::Existing(prev_lrevid) = restored else {
                    return Err(CoreError::undo(format!(
                        "{oid} was modified after {tid} and did not exist before it"
                    )));
                };
                if current_md.is_tombstone() || undone.is_tombstone() {
                    return Err(CoreError::undo(format!("{oid} was modified after {tid}")));
                }
                let old = state.pickle(oid, undone.lrevid)?;
                let committed = state.pickle(oid, current_md.lrevid)?;
                let new = state.pickle(oid, prev_lrevid)?;
                let merged = resolver
                    .as_ref()
                    .and_then(|r| r.resolve(oid, Some(&old), &committed, &new))
                    .ok_or_else(|| {
                        CoreError::undo(format!("{oid} was modified after {tid}"))
                    })?;
                StagedPickle::New {
                    data: merged.data,
                    refs: normalize(&merged.refs),
                }
            };
            staged.push((
                oid,
                StagedRevision {
                    vid,
                    nvrevid,
                    pickle,
                    prevrevid: current_tid,
                    replaces_vid: current_md.vid,
                    obsoletes: obsoleted_by(current, vid),
                },
            ));
        }

        for (oid, revision) in staged {
            state.stage(oid, revision)?;
        }
        debug!(%tid, objects = oids.len(), "undo staged");
        Ok(oids)
    }
}

pub(super) fn undo_log(
    state: &EngineState,
    first: i64,
    last: i64,
    filter: Option<UndoFilter<'_>>,
) -> CoreResult<Vec<TransactionDescription>> {
    let first = first.max(0);
    let last = if last < 0 { first - last } else { last };
    let mut out = Vec::new();
    let mut index: i64 = 0;
    for (key, value) in state.kv.prefix(TableId::TxnMetadata, &[]).rev() {
        if index >= last {
            break;
        }
        let tid = Tid::new(kv::key_part(key, 0).unwrap_or_default());
        if tid <= state.pack_tid {
            break;
        }
        let record: super::records::TxnRecord = super::records::from_cbor(value)?;
        let description = TransactionDescription {
            tid,
            user: record.user,
            description: record.description,
            extension: record.extension,
        };
        if filter.is_some_and(|f| !f(&description)) {
            continue;
        }
        if index >= first {
            out.push(description);
        }
        index += 1;
    }
    Ok(out)
}

pub(super) fn history(
    state: &EngineState,
    oid: Oid,
    version: &str,
    size: usize,
) -> CoreResult<Vec<RevisionInfo>> {
    let (mut tid, _) = state.current(oid)?.ok_or(CoreError::not_found(oid))?;
    let mut out = Vec::new();
    while out.len() < size && !tid.is_zero() {
        let Some(record) = state.metadata(oid, tid)? else {
            break;
        };
        let revision_version = state.version_name(record.vid);
        if revision_version.is_empty() || revision_version == version {
            let txn = state.txn_record(tid)?.unwrap_or_default();
            let size = if record.is_tombstone() {
                0
            } else {
                state.pickle(oid, record.lrevid)?.len()
            };
            out.push(RevisionInfo {
                tid,
                version: revision_version,
                size,
                user: txn.user,
                description: txn.description,
            });
        }
        tid = record.prevrevid;
    }
    Ok(out)
}
