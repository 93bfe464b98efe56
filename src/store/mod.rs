//! Persistence layer: libSQL-backed storage for landlords, cleaners, jobs,
//! dispatch attempts and reviews.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{AcceptResult, AssignResult, CancelResult, Database, DeleteResult};
