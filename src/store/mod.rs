//! Persistence layer — account links and one-shot postback tokens.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{AccountLink, PostbackToken, Store};
