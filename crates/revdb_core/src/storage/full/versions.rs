//! Version branches.

use super::commit::{obsoleted_by, StagedPickle, StagedRevision};
use super::{EngineState, FullStorage};
use crate::error::{CoreError, CoreResult};
use crate::kv::{self, TableId};
use crate::transaction::Transaction;
use crate::types::{Oid, Tid, VersionId};

/// Names of the versions that hold objects.
pub(super) fn versions(state: &EngineState) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for (key, _) in state.kv.prefix(TableId::CurrentVersions, &[]) {
        let vid = VersionId::new(kv::key_part(key, 0).unwrap_or_default());
        let name = state.version_name(vid);
        if names.last() != Some(&name) {
            names.push(name);
        }
    }
    names
}

pub(super) fn version_empty(state: &EngineState, version: &str) -> bool {
    if version.is_empty() {
        return state.kv.is_empty(TableId::CurrentVersions);
    }
    match state.vid_of(version) {
        Some(vid) => state
            .kv
            .prefix(TableId::CurrentVersions, &kv::encode_u64(vid.as_u64()))
            .next()
            .is_none(),
        None => true,
    }
}

impl FullStorage {
    /// Commits `source` into `dest` (`Some`) or aborts it (`None`).
    pub(super) fn move_version(
        &self,
        source: &str,
        dest: Option<&str>,
        txn: &Transaction,
    ) -> CoreResult<Vec<Oid>> {
        self.ensure_writable()?;
        if source.is_empty() {
            return Err(CoreError::invalid_operation(
                "the non-version cannot be committed or aborted",
            ));
        }
        if dest == Some(source) {
            return Err(CoreError::invalid_operation(format!(
                "cannot commit version {source:?} into itself"
            )));
        }
        let mut state = self.state.lock();
        state.tpc_for(txn)?;
        let Some(source_vid) = state.vid_of(source) else {
            return Ok(Vec::new());
        };
        let dest_vid = match dest {
            Some(dest) => state.vid_for_write(dest)?,
            None => VersionId::NON_VERSION,
        };

        let oids: Vec<Oid> = state
            .kv
            .prefix(TableId::CurrentVersions, &kv::encode_u64(source_vid.as_u64()))
            .filter_map(|(key, _)| kv::key_part(key, 1).map(Oid::new))
            .collect();

        for &oid in &oids {
            if state.is_pending(oid) {
                return Err(CoreError::storage_system(format!(
                    "{oid} was already modified in this transaction"
                )));
            }
            let current = state.current(oid)?;
            let Some((_, record)) = current else {
                continue;
            };
            if record.vid != source_vid {
                return Err(CoreError::storage_system(format!(
                    "{oid} is listed in version {source:?} but its current revision is not"
                )));
            }
            let (pickle, nvrevid) = match dest {
                Some(_) => {
                    let pickle = if record.is_tombstone() {
                        StagedPickle::Tombstone
                    } else {
                        StagedPickle::Existing(record.lrevid)
                    };
                    let nvrevid = if dest_vid.is_non_version() {
                        Tid::ZERO
                    } else {
                        record.nvrevid
                    };
                    (pickle, nvrevid)
                }
                None => {
                    let base = if record.nvrevid.is_zero() {
                        None
                    } else {
                        state.metadata(oid, record.nvrevid)?
                    };
                    let pickle = match base {
                        Some(base) if !base.is_tombstone() => StagedPickle::Existing(base.lrevid),
                        _ => StagedPickle::Tombstone,
                    };
                    (pickle, Tid::ZERO)
                }
            };
            state.stage(
                oid,
                StagedRevision {
                    vid: dest_vid,
                    nvrevid,
                    pickle,
                    prevrevid: current.map_or(Tid::ZERO, |(tid, _)| tid),
                    replaces_vid: source_vid,
                    obsoletes: obsoleted_by(current, dest_vid),
                },
            )?;
        }
        Ok(oids)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::error::CoreError;
    use crate::storage::Storage;
    use crate::transaction::TransactionManager;
    use crate::types::{Oid, Tid};

    fn setup() -> (crate::storage::FullStorage, Oid) {
        let storage = storage();
        let oid = storage.new_oid().unwrap();
        commit_at(&storage, 10, &[(oid, 0, b"base", &[])]).unwrap();
        commit_in(&storage, 20, "draft", &[(oid, 10, b"draft", &[])]).unwrap();
        (storage, oid)
    }

    fn run(
        storage: &crate::storage::FullStorage,
        at: u64,
        op: impl FnOnce(&crate::transaction::Transaction) -> Vec<Oid>,
    ) {
        let txn = TransactionManager::new().begin();
        storage.tpc_begin_at(&txn, Tid::new(at)).unwrap();
        op(&txn);
        storage.tpc_vote(&txn).unwrap();
        storage.tpc_finish(&txn, &mut |_, _| {}).unwrap();
    }

    #[test]
    fn version_data_is_private_to_the_version() {
        let (storage, oid) = setup();
        assert_eq!(storage.load(oid, "draft").unwrap(), (b"draft".to_vec(), Tid::new(20)));
        assert_eq!(storage.load(oid, "").unwrap(), (b"base".to_vec(), Tid::new(10)));
        assert_eq!(storage.modified_in_version(oid).unwrap(), "draft");
        assert_eq!(storage.versions().unwrap(), vec!["draft".to_string()]);
        assert!(!storage.version_empty("draft").unwrap());
        assert!(storage.version_empty("other").unwrap());
    }

    #[test]
    fn writes_from_another_version_are_locked_out() {
        let (storage, oid) = setup();
        let err = commit_in(&storage, 30, "other", &[(oid, 20, b"x", &[])]).unwrap_err();
        assert!(matches!(err, CoreError::VersionLock { locked_in, .. } if locked_in == "draft"));
        let err = commit_at(&storage, 31, &[(oid, 10, b"x", &[])]).unwrap_err();
        assert!(matches!(err, CoreError::VersionLock { .. }));
    }

    #[test]
    fn commit_version_publishes_the_data() {
        let (storage, oid) = setup();
        run(&storage, 30, |txn| {
            storage.commit_version("draft", "", txn).unwrap()
        });
        assert_eq!(storage.load(oid, "").unwrap(), (b"draft".to_vec(), Tid::new(30)));
        assert!(storage.version_empty("draft").unwrap());
        assert_eq!(storage.modified_in_version(oid).unwrap(), "");
        assert!(storage.versions().unwrap().is_empty());
    }

    #[test]
    fn commit_version_into_another_version() {
        let (storage, oid) = setup();
        run(&storage, 30, |txn| {
            storage.commit_version("draft", "review", txn).unwrap()
        });
        assert_eq!(storage.load(oid, "review").unwrap().0, b"draft");
        assert_eq!(storage.load(oid, "").unwrap().0, b"base");
        assert_eq!(storage.modified_in_version(oid).unwrap(), "review");
    }

    #[test]
    fn abort_version_restores_non_version_data() {
        let (storage, oid) = setup();
        let created = storage.new_oid().unwrap();
        commit_in(&storage, 25, "draft", &[(created, 0, b"new", &[])]).unwrap();
        run(&storage, 30, |txn| {
            let oids = storage.abort_version("draft", txn).unwrap();
            assert_eq!(oids.len(), 2);
            oids
        });
        assert_eq!(storage.load(oid, "").unwrap(), (b"base".to_vec(), Tid::new(30)));
        assert_eq!(storage.load(oid, "draft").unwrap().0, b"base");
        assert!(storage.load(created, "").is_err());
        assert!(storage.version_empty("").unwrap());
    }

    #[test]
    fn undo_of_commit_version_restores_the_version() {
        let (storage, oid) = setup();
        run(&storage, 30, |txn| {
            storage.commit_version("draft", "", txn).unwrap()
        });
        run(&storage, 40, |txn| {
            storage.undo(Tid::new(30), txn).unwrap()
        });
        assert_eq!(storage.load(oid, "").unwrap().0, b"base");
        assert_eq!(storage.load(oid, "draft").unwrap(), (b"draft".to_vec(), Tid::new(40)));
        assert_eq!(storage.modified_in_version(oid).unwrap(), "draft");
        assert!(!storage.version_empty("draft").unwrap());

        // the restored version still locks out other writers
        let err = commit_at(&storage, 50, &[(oid, 40, b"x", &[])]).unwrap_err();
        assert!(matches!(err, CoreError::VersionLock { .. }));
    }

    #[test]
    fn undo_of_abort_version_restores_the_version() {
        let (storage, oid) = setup();
        let created = storage.new_oid().unwrap();
        commit_in(&storage, 25, "draft", &[(created, 0, b"new", &[])]).unwrap();
        run(&storage, 30, |txn| {
            storage.abort_version("draft", txn).unwrap()
        });
        run(&storage, 40, |txn| {
            let mut oids = storage.undo(Tid::new(30), txn).unwrap();
            oids.sort();
            assert_eq!(oids, vec![oid, created]);
            oids
        });
        assert_eq!(storage.load(oid, "").unwrap().0, b"base");
        assert_eq!(storage.load(oid, "draft").unwrap().0, b"draft");
        assert_eq!(storage.load(created, "draft").unwrap().0, b"new");
        assert_eq!(storage.modified_in_version(created).unwrap(), "draft");
        assert_eq!(storage.versions().unwrap(), vec!["draft".to_string()]);

        commit_in(&storage, 50, "draft", &[(oid, 40, b"edited", &[])]).unwrap();
        assert_eq!(storage.load(oid, "draft").unwrap().0, b"edited");
    }

    #[test]
    fn non_version_cannot_be_moved() {
        let (storage, _) = setup();
        let txn = TransactionManager::new().begin();
        storage.tpc_begin(&txn).unwrap();
        assert!(storage.abort_version("", &txn).is_err());
        assert!(storage.commit_version("draft", "draft", &txn).is_err());
        assert!(storage.commit_version("missing", "", &txn).unwrap().is_empty());
        storage.tpc_abort(&txn).unwrap();
    }
}
