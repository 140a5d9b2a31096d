//! Store initialization and schema

pub mod init;
pub mod schema;

pub use init::*;
