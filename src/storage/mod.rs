//! Period store definitions and backends.
//!
//! [`PeriodStore`] is the abstract interface; [`InMemoryPeriodStore`] keeps
//! everything in memory and, with the `persistent` feature, the
//! [`persistent`] module provides a durable directory-backed store.

mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemoryPeriodStore;
pub use traits::{DiskIndex, IndexReader, IndexSlot, PeriodStore, RowWindow, StorageError};
