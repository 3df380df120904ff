// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local durable store: read cache, offline queue log, dead letters and
//! unresolved conflicts.

pub mod memory;
pub mod sql;
pub mod traits;

pub use memory::InMemoryStore;
pub use sql::SqlStore;
pub use traits::{CacheEntry, DeadLetter, DurableStore, StorageError};
