//! Cross-device synchronization engine.
//!
//! - `item`: sync items, fingerprints and reduced variants
//! - `queue`: priority queue with per-key ordering, retry and history
//! - `offline`: bounded per-device buffers for unreachable devices
//! - `conflict`: detection, merging and resolution strategies
//! - `coordinator`: the drain loop that fans operations out to devices

pub mod conflict;
pub mod coordinator;
pub mod item;
pub mod offline;
pub mod queue;

pub use conflict::{ConflictRecord, ConflictResolver, ConflictStrategy};
pub use coordinator::{Deliverer, DeliveryOutcome, DeliveryResult, SyncCoordinator};
pub use item::{ItemType, OperationKind, SyncItem};
pub use offline::OfflineQueue;
pub use queue::{OperationRecord, SyncOperation, SyncQueue, Targeting};
