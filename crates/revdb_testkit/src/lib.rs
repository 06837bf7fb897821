//! # revdb testkit
//!
//! Test utilities for revdb.
//!
//! This crate provides:
//! - Storage fixtures that survive being reopened ([`MemoryFiles`], [`TempStorage`])
//! - A demo object type ([`Item`]) with a CBOR codec and an object factory
//! - A backend that simulates crashes ([`CrashableBackend`])
//! - A jar that records the two-phase commit calls it receives ([`RecordingJar`])
//! - A storage wrapper that defers store outcomes to the vote ([`DeferredStorage`])
//! - Proptest strategies
//!
//! The cross-module integration tests live in `tests/`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod crash;
pub mod deferred;
pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod recording;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::codec::*;
    pub use crate::crash::*;
    pub use crate::deferred::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::recording::*;
}

pub use codec::*;
pub use crash::*;
pub use deferred::*;
pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use recording::*;
