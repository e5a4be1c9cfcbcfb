//! Read cache with conditional revalidation and offline support.
//!
//! Every successful GET stores the server's revalidation token (ETag) and body.
//! Later reads send the token back; a 304 reuses the stored body, and a network
//! failure serves the last known-good copy.

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, MemoryStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, ReadError};
