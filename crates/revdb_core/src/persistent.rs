//! Persistent objects.
//!
//! A [`PersistentObject`] pairs application state with the bookkeeping a
//! connection needs: the object's id, the connection that owns it, the
//! serial its state reflects, and where it is in its life cycle:
//!
//! ```text
//! Unsaved ──commit──► Saved ◄──commit / load── Changed
//!                       │  ▲                       │
//!          invalidate   │  │ activate              │ abort
//!                       ▼  │                       │
//!                      Ghost ◄─────────────────────┘
//! ```
//!
//! Turning pickles into state and back is the application's business:
//! state types implement [`Persistent`], and an [`ObjectFactory`] rebuilds
//! them from stored bytes.

use crate::conflict::ResolvedState;
use crate::connection::ConnectionInner;
use crate::error::{CoreError, CoreResult};
use crate::transaction::Jar;
use crate::types::{Oid, Tid};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

/// Shared handle to a persistent object.
pub type PRef = Arc<PersistentObject>;

/// Life-cycle state of a persistent object within its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Never committed. State is in memory only.
    Unsaved,
    /// State matches the revision named by the serial.
    Saved,
    /// Modified in the current transaction.
    Changed,
    /// State not loaded; the next access loads it.
    Ghost,
}

/// Access to `Any` for trait objects.
pub trait AsAny: Any {
    /// Returns `self` as `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
    /// Returns `self` as `&mut dyn Any`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Application state of a persistent object.
pub trait Persistent: AsAny + Send + Sync {
    /// Encodes the state. Every referenced persistent object must go
    /// through [`ReferenceWriter::reference`], which also records the
    /// reference for the storage's garbage collector.
    fn encode(&self, refs: &mut ReferenceWriter<'_>) -> CoreResult<Vec<u8>>;

    /// True if conflicting writes of this type may be merged by the
    /// factory's [`ObjectFactory::resolve_conflict`].
    fn can_resolve_conflicts(&self) -> bool {
        false
    }
}

/// Rebuilds object state from stored bytes.
pub trait ObjectFactory: Send + Sync {
    /// Decodes a pickle. References are turned back into objects with
    /// [`ReferenceReader::resolve`].
    fn decode(
        &self,
        oid: Oid,
        data: &[u8],
        refs: &mut ReferenceReader<'_>,
    ) -> CoreResult<Box<dyn Persistent>>;

    /// State of the root object of a new database.
    fn new_root(&self) -> Box<dyn Persistent>;

    /// Merges a conflicting write. `old` is the state the writer started
    /// from, `committed` the state committed meanwhile, `new` the
    /// writer's state. Returns `None` if the states cannot be merged.
    fn resolve_conflict(
        &self,
        _oid: Oid,
        _old: Option<&[u8]>,
        _committed: &[u8],
        _new: &[u8],
    ) -> Option<ResolvedState> {
        None
    }
}

struct ObjectMeta {
    oid: Option<Oid>,
    jar: Option<Weak<ConnectionInner>>,
    serial: Tid,
    state: ObjectState,
}

/// A persistent object: identity, owner, serial and (unless a ghost)
/// state.
pub struct PersistentObject {
    meta: Mutex<ObjectMeta>,
    data: RwLock<Option<Box<dyn Persistent>>>,
}

impl PersistentObject {
    /// Creates a new, unsaved object.
    pub fn new(value: impl Persistent) -> PRef {
        Self::from_boxed(Box::new(value))
    }

    /// Creates a new, unsaved object from boxed state.
    #[must_use]
    pub fn from_boxed(value: Box<dyn Persistent>) -> PRef {
        Arc::new(Self {
            meta: Mutex::new(ObjectMeta {
                oid: None,
                jar: None,
                serial: Tid::ZERO,
                state: ObjectState::Unsaved,
            }),
            data: RwLock::new(Some(value)),
        })
    }

    pub(crate) fn ghost(oid: Oid, jar: Weak<ConnectionInner>) -> PRef {
        Arc::new(Self {
            meta: Mutex::new(ObjectMeta {
                oid: Some(oid),
                jar: Some(jar),
                serial: Tid::ZERO,
                state: ObjectState::Ghost,
            }),
            data: RwLock::new(None),
        })
    }

    /// The object id, once the object belongs to a connection.
    #[must_use]
    pub fn oid(&self) -> Option<Oid> {
        self.meta.lock().oid
    }

    /// Serial of the revision the in-memory state reflects.
    #[must_use]
    pub fn serial(&self) -> Tid {
        self.meta.lock().serial
    }

    /// Current life-cycle state.
    #[must_use]
    pub fn state(&self) -> ObjectState {
        self.meta.lock().state
    }

    /// True if the state is not loaded.
    #[must_use]
    pub fn is_ghost(&self) -> bool {
        self.state() == ObjectState::Ghost
    }

    /// The connection owning the object, as a transaction participant.
    #[must_use]
    pub fn jar(&self) -> Option<Arc<dyn Jar>> {
        self.connection().map(|c| c as Arc<dyn Jar>)
    }

    pub(crate) fn connection(&self) -> Option<Arc<ConnectionInner>> {
        self.meta.lock().jar.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn has_owner(&self) -> bool {
        self.meta.lock().jar.is_some()
    }

    pub(crate) fn belongs_to(&self, conn: &ConnectionInner) -> bool {
        self.meta
            .lock()
            .jar
            .as_ref()
            .is_some_and(|jar| std::ptr::eq(jar.as_ptr(), conn))
    }

    pub(crate) fn attach(&self, oid: Oid, jar: Weak<ConnectionInner>) {
        let mut meta = self.meta.lock();
        meta.oid = Some(oid);
        meta.jar = Some(jar);
    }

    /// Forgets the id and owner of an object whose creation was rolled
    /// back. The state is kept.
    pub(crate) fn detach(&self) {
        let mut meta = self.meta.lock();
        meta.oid = None;
        meta.jar = None;
        meta.serial = Tid::ZERO;
        meta.state = ObjectState::Unsaved;
    }

    pub(crate) fn set_loaded(&self, value: Box<dyn Persistent>, serial: Tid) {
        let mut meta = self.meta.lock();
        *self.data.write() = Some(value);
        meta.serial = serial;
        meta.state = ObjectState::Saved;
    }

    pub(crate) fn mark_saved(&self, serial: Tid) {
        let mut meta = self.meta.lock();
        meta.serial = serial;
        if meta.state != ObjectState::Ghost {
            meta.state = ObjectState::Saved;
        }
    }

    pub(crate) fn set_serial(&self, serial: Tid) {
        self.meta.lock().serial = serial;
    }

    /// Moves a saved object to `Changed`. Returns true if it was saved.
    pub(crate) fn mark_changed(&self) -> bool {
        let mut meta = self.meta.lock();
        if meta.state == ObjectState::Saved {
            meta.state = ObjectState::Changed;
            return true;
        }
        false
    }

    /// Drops the state of an object that can be reloaded. Unsaved objects
    /// and objects without an id are left alone.
    pub(crate) fn ghostify(&self) -> bool {
        let mut meta = self.meta.lock();
        if meta.oid.is_none() || matches!(meta.state, ObjectState::Unsaved | ObjectState::Ghost) {
            return false;
        }
        *self.data.write() = None;
        meta.state = ObjectState::Ghost;
        true
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&dyn Persistent) -> R) -> Option<R> {
        let data = self.data.read_recursive();
        data.as_deref().map(f)
    }

    pub(crate) fn with_state_mut<R>(&self, f: impl FnOnce(&mut dyn Persistent) -> R) -> Option<R> {
        let mut data = self.data.write();
        data.as_deref_mut().map(f)
    }
}

impl fmt::Debug for PersistentObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.meta.lock();
        f.debug_struct("PersistentObject")
            .field("oid", &meta.oid)
            .field("serial", &meta.serial)
            .field("state", &meta.state)
            .finish_non_exhaustive()
    }
}

/// Collects the references of an object being encoded.
///
/// Referencing an object that has no id yet gives it one in the owning
/// connection; the connection then stores it in the same commit.
pub struct ReferenceWriter<'a> {
    owner: Option<&'a ConnectionInner>,
    refs: Vec<Oid>,
    discovered: Vec<PRef>,
}

impl<'a> ReferenceWriter<'a> {
    /// A writer for state that may only reference stored objects.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            owner: None,
            refs: Vec::new(),
            discovered: Vec::new(),
        }
    }

    pub(crate) fn for_connection(owner: &'a ConnectionInner) -> Self {
        Self {
            owner: Some(owner),
            refs: Vec::new(),
            discovered: Vec::new(),
        }
    }

    /// Records a reference to `object` and returns its oid.
    pub fn reference(&mut self, object: &PRef) -> CoreResult<Oid> {
        if let Some(oid) = object.oid() {
            if let Some(owner) = self.owner {
                if !object.belongs_to(owner) {
                    return Err(CoreError::invalid_reference(format!(
                        "{oid} belongs to another connection"
                    )));
                }
            }
            self.refs.push(oid);
            return Ok(oid);
        }
        let Some(owner) = self.owner else {
            return Err(CoreError::invalid_reference(
                "new objects can only be referenced inside a connection",
            ));
        };
        let oid = owner.adopt(object)?;
        self.discovered.push(Arc::clone(object));
        self.refs.push(oid);
        Ok(oid)
    }

    /// Oids referenced so far.
    #[must_use]
    pub fn refs(&self) -> &[Oid] {
        &self.refs
    }

    pub(crate) fn finish(self) -> (Vec<Oid>, Vec<PRef>) {
        (self.refs, self.discovered)
    }
}

/// Turns stored oids back into objects while decoding.
pub struct ReferenceReader<'a> {
    owner: &'a ConnectionInner,
}

impl<'a> ReferenceReader<'a> {
    pub(crate) fn new(owner: &'a ConnectionInner) -> Self {
        Self { owner }
    }

    /// The object with id `oid`, as a ghost unless already loaded.
    pub fn resolve(&mut self, oid: Oid) -> CoreResult<PRef> {
        self.owner.ghost_for(oid)
    }
}
