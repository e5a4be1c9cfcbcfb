//! Offline mutation queue.
//!
//! Writes are persisted before any network attempt and replayed one at a time
//! in creation order:
//! - Transport faults and 5xx responses are retried with capped backoff
//! - Other 4xx responses reject the mutation permanently
//! - Outcomes are published on a typed event bus, once per entry

mod backoff;
mod entry;
mod events;
mod machine;
mod mutation_queue;
mod store;
pub mod worker;

pub use backoff::BackoffSchedule;
pub use entry::{EntryId, QueueEntry};
pub use events::{DrainReport, DrainTrigger, EnqueueReceipt, QueueEvent, QueueTopic};
pub use machine::{is_transient, EntryState, UNSENT_STATUS};
pub use mutation_queue::{MutationQueue, PendingEntry};
pub use store::{QueueStore, ResilientStore};

#[cfg(test)]
pub use store::MemoryQueueStore;
