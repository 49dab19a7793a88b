//! Job Store backends.

pub mod libsql_backend;
pub mod memory;
pub mod traits;

pub use libsql_backend::LibSqlJobStore;
pub use memory::MemoryJobStore;
pub use traits::{JobPatch, JobStore};
