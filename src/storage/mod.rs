//! Durable bridge state.
//!
//! Each store owns exactly one file under the state directory and is the only
//! writer of it.

pub mod document;
pub mod identity;
pub mod offsets;
pub mod receipts;
pub mod spool;

pub use document::{JsonDocument, write_atomic};
pub use identity::MachineIdentity;
pub use offsets::OffsetStore;
pub use receipts::ReceiptStore;
pub use spool::TelemetrySpool;
