//! # Asset caching
//!
//! Every asset type has one [`StreamableCache`], shared by all loading flows of that type.
//! It consists of three tables, each guarded by its own mutex that is never held across an
//! `.await`:
//!
//! - The asset table maps a [`CacheKey`](crate::intention::CacheKey) to a loaded asset and a
//!   reference count. Entries whose reference count dropped to zero are kept around until an
//!   external memory monitor calls [`StreamableCache::unload`].
//! - The [`OngoingRequests`] table implements single-flight: the first flow asking for a key
//!   becomes the leader and fetches, every later flow for the same key becomes a follower
//!   and awaits the leader's shared result.
//! - The [`IrrecoverableFailures`] table memoizes errors of keys for which every permitted
//!   source was exhausted, so they are never fetched again until invalidated.
//!
//! A cache may additionally be backed by a [`DiskCache`]. It holds the payloads of assets
//! whose intentions the [`Loader`](crate::loader::Loader) qualifies for it, and is consulted
//! after a miss in memory, before any fetch.
//!
//! ### Metrics
//!
//! Each of these is tagged with a `cache` field naming the asset type:
//!
//! - `caches.access`: All lookups.
//! - `caches.memory.hit`: Lookups served from the asset table.
//! - `caches.disk.hit`: Payloads read from the disk tier.
//! - `caches.disk.write_size`: Bytes written to the disk tier.
//! - `caches.ongoing.joined`: Flows that joined a running fetch as follower.
//! - `caches.unload.evicted`: Entries evicted under memory pressure.

mod disk;
mod failures;
mod memory;
mod ongoing;

pub use disk::DiskCache;
pub use failures::IrrecoverableFailures;
pub use memory::{MemoryPressure, StreamableCache};
pub use ongoing::{LeaderGuard, Ongoing, OngoingRequests, SharedResult};
