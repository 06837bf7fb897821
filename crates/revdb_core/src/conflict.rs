//! Write-conflict resolution.
//!
//! When a store finds that another transaction committed the object after
//! the writer read it, the storage hands the three states involved to a
//! [`ConflictResolver`]. The resolver either merges them or declines, in
//! which case the store fails with a write conflict.

use crate::types::Oid;
use std::fmt;

/// A merged object state produced by a resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedState {
    /// Merged pickle bytes.
    pub data: Vec<u8>,
    /// Objects the merged state references.
    pub refs: Vec<Oid>,
}

/// Merges concurrent changes to one object.
pub trait ConflictResolver: Send + Sync {
    /// Attempts a three-way merge.
    ///
    /// `old` is the state the writer started from (absent if that revision
    /// is gone), `committed` is the state committed in the meantime and
    /// `new` is what the writer wants to store. Returns `None` to leave the
    /// conflict unresolved.
    fn resolve(
        &self,
        oid: Oid,
        old: Option<&[u8]>,
        committed: &[u8],
        new: &[u8],
    ) -> Option<ResolvedState>;
}

/// Resolver that never resolves anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResolver;

impl ConflictResolver for NoResolver {
    fn resolve(&self, _: Oid, _: Option<&[u8]>, _: &[u8], _: &[u8]) -> Option<ResolvedState> {
        None
    }
}

/// Adapts a closure into a resolver.
pub struct FnResolver<F>(pub F);

impl<F> ConflictResolver for FnResolver<F>
where
    F: Fn(Oid, Option<&[u8]>, &[u8], &[u8]) -> Option<ResolvedState> + Send + Sync,
{
    fn resolve(
        &self,
        oid: Oid,
        old: Option<&[u8]>,
        committed: &[u8],
        new: &[u8],
    ) -> Option<ResolvedState> {
        (self.0)(oid, old, committed, new)
    }
}

impl<F> fmt::Debug for FnResolver<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnResolver")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_resolve() {
        let take_mine = FnResolver(|_: Oid, _: Option<&[u8]>, _: &[u8], new: &[u8]| {
            Some(ResolvedState {
                data: new.to_vec(),
                refs: Vec::new(),
            })
        });
        let merged = take_mine.resolve(Oid::new(1), None, b"theirs", b"mine").unwrap();
        assert_eq!(merged.data, b"mine");
        assert!(NoResolver.resolve(Oid::new(1), None, b"a", b"b").is_none());
    }
}
