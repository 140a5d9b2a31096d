//! Store access: pending ledger and structured archive

pub mod archive;
pub mod ledger;

pub use archive::{Archive, ArchiveCounts};
pub use ledger::{ExpectedSlot, Ledger};
