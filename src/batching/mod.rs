// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

pub mod change_batcher;

pub use change_batcher::{
    spawn_batcher, BatchedUpdate, BatcherConfig, ChangeBatcher, ChangeEvent, FlushReason, LocalState,
};
