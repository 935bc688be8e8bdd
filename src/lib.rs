//! A persistent, multi-producer/multi-consumer queue backed entirely by
//! a POSIX filesystem: no database, no network service, just `mkdir`,
//! `rename`, `rmdir` and lexical directory ordering composed into a
//! best-effort FIFO with advisory locking and periodic garbage
//! collection.
//!
//! Two element shapes share the same identity/iteration machinery
//! ([`base::BaseQueue`]):
//!
//! - [`normal::Queue`] — schema-bearing elements, one file per field,
//!   plus a `locked/` marker sub-directory.
//! - [`simple::SimpleQueue`] — single opaque-payload elements stored as
//!   plain files.
//!
//! Both expose `add`/`lock`/`unlock`/`get`/`remove`/`touch`/`count`/
//! `purge` and the shared `id`/`copy`/`first`/`next` iteration contract
//! an external "queue-set" layer could merge across several queues (see
//! the module docs on [`base::BaseQueue`]); this crate does not itself
//! implement that merging layer.

pub mod base;
pub mod config;
pub mod error;
pub mod fs_primitives;
pub mod logging;
pub mod name;
pub mod normal;
pub mod purge;
pub mod schema;
pub mod simple;
pub mod umask;

pub use base::{BaseQueue, QueueId};
pub use error::{QueueError, Result};
pub use normal::{Queue, QueueOptions};
pub use purge::PurgeWarning;
pub use schema::{DecodedValue, FieldType, FieldValue, Schema};
pub use simple::{SimpleQueue, SimpleQueueOptions};
