//! Persistence layer: libSQL-backed storage for sessions, job records, and
//! the task queue.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, QueuedTask, SessionRecord};
