//! A concurrent hash table.
//!
//! This crate provides [`HashMap`], a hash table that may be accessed from any number of threads
//! concurrently: lookups never block, and updates contend only when they land in the same bin.
//! The design follows the classic striped concurrent hash table: an array of bins, each of which
//! holds either a linked list of entries or, for pathologically colliding keys, a red-black
//! tree. Each bin is its own lock, encoded in two spare bits of the bin-head node's hash word,
//! so the map carries no lock table and uncontended updates touch only the memory they modify.
//!
//! # A note on `Guard`s
//!
//! Because readers proceed without locks even while entries are being removed, removed memory
//! must not be reclaimed while a reader might still observe it. `squall` uses epoch-based
//! reclamation through [`crossbeam-epoch`](epoch), and its operations take a
//! [`Guard`](epoch::Guard) that pins the current epoch. You can obtain one with
//! [`HashMap::guard`], or use [`HashMap::pin`] to get a [`HashMapRef`] that manages the guard
//! for you:
//!
//! ```
//! use squall::HashMap;
//!
//! let map = HashMap::new();
//!
//! // explicit guard:
//! let guard = map.guard();
//! map.insert("panther", 1, &guard);
//! assert_eq!(map.get("panther", &guard), Some(&1));
//!
//! // or a pinned reference:
//! map.pin().insert("lynx", 2);
//! assert_eq!(map.pin().get("lynx"), Some(&2));
//! ```
//!
//! Keep in mind that holding a guard prevents the collection of any garbage produced while it is
//! held, so long-lived guards should be dropped and re-pinned periodically.
//!
//! # Consistency
//!
//! Retrieval operations reflect the results of the most recently *completed* update operations
//! holding upon their onset; a lookup that observes an update has a happens-before relationship
//! with that update. Aggregate operations such as [`HashMap::len`] are only useful as transient
//! summaries when the map is under concurrent update, and the iterators are *weakly consistent*:
//! they never error out under concurrent modification, they visit each entry present at
//! construction at most once, and they may or may not reflect changes made after they were
//! created.
//!
//! # Resizing behavior
//!
//! The table grows when its 0.75 density threshold is exceeded. Resizing is performed by a
//! single owner thread one bin at a time while the old table remains fully serviceable;
//! operations that encounter an already-transferred bin chase a forwarding marker into the new
//! table. If you can estimate your final size, constructing the map with
//! [`HashMap::with_capacity`] avoids the intermediate resizes.
//!
//! # Bulk operations
//!
//! [`HashMap::par_for_each`], [`HashMap::par_search`], [`HashMap::par_reduce`],
//! [`HashMap::par_fold`], and their key- and value-domain variants run over the table in
//! parallel by recursively splitting the traversal cursor onto [rayon]'s work-stealing pool. To
//! run them on a dedicated pool, call them from inside `rayon::ThreadPool::install`.
#![deny(missing_docs, missing_debug_implementations, unreachable_pub)]
#![warn(rust_2018_idioms)]

mod adder;
mod bulk;
mod map;
mod map_ref;
mod node;
mod raw;
mod rayon_impls;
#[cfg(feature = "serde")]
mod serde_impls;

/// Iterator types produced by [`HashMap`].
pub mod iter;

pub use map::{HashMap, TryInsertError};
pub use map_ref::HashMapRef;

/// Re-export of [`crossbeam-epoch`](https://docs.rs/crossbeam-epoch), whose
/// [`Guard`](epoch::Guard) type parameterizes all map operations.
pub use crossbeam_epoch as epoch;

/// The default [`BuildHasher`](std::hash::BuildHasher) for [`HashMap`].
pub type DefaultHashBuilder = ahash::RandomState;
