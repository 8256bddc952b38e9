//! Persistence layer, the libSQL-backed ticket store.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{TicketOverview, TicketPatch, TicketStore};
