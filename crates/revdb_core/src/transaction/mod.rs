//! Transaction coordination with two-phase commit.
//!
//! A [`Transaction`] collects the objects modified on its behalf. On
//! commit it drives the [`Jar`]s owning those objects through two-phase
//! commit:
//! - **Ordering**: jars are begun in sort-key order, so two transactions
//!   touching the same storages never wait on each other in a cycle
//! - **Atomicity**: any failure before the final phase unwinds every jar
//! - **Sub-transactions**: work can be committed into the jars' temporary
//!   stores and folded into the final commit
//! - **Hosed state**: a failure after some jars finished is unrecoverable
//!   and stops every manager in the process from committing

mod commit;
mod jar;
mod manager;
mod state;

pub use jar::{Jar, TxnObject};
pub use manager::{Synchronizer, TransactionManager};
pub use state::{Transaction, TransactionStatus};
