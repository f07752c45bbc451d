//! Copy-on-write balanced trees over densely packed binary blocks.
//!
//! This crate provides [`Tree`], a B-tree whose nodes are fixed-capacity blocks owned by a
//! [`BlockStore`]. Every node stores its entries column by column in packed binary structures,
//! and every branch keeps a per-child [`Summary`] (counts, sums, maxima or symbol counts), so
//! positional queries run in O(log n) block reads:
//!
//! - [`find`](Tree::find) - Key search over sorted schemas (`Lt`, `Le`, `Eq`, `Ge`, `Gt`)
//! - [`seek`](Tree::seek) / [`skip_forward`](Tree::skip_forward) - Positional access
//! - [`rank`](Tree::rank) / [`select`](Tree::select) - Succinct queries over symbol sequences
//! - [`find_sum`](Tree::find_sum) - Ranked find over prefix sums
//!
//! Writes never touch a published block. Each one clones the nodes on its path, publishes a new
//! root for its snapshot label and leaves older snapshots (see [`Tree::branch`]) unchanged.
//!
//! # Example
//!
//! ```
//! use packtree::{Entry, Schema, SearchType, Tree};
//!
//! let mut set = Tree::new(Schema::ordered_set())?;
//! for key in [5, 1, 9, 3] {
//!     set.insert_sorted(&[key])?;
//! }
//! assert_eq!(set.size()?, 4);
//!
//! let chunk = set.find(9, SearchType::Eq)?;
//! assert!(chunk.is_found());
//! assert_eq!(chunk.pos(), 3);
//!
//! // Snapshots share nodes until one side writes.
//! let mut copy = set.branch("copy")?;
//! copy.append(&[Entry::from_slice(&[12])])?;
//! assert_eq!(set.size()?, 4);
//! assert_eq!(copy.size()?, 5);
//! # Ok::<(), packtree::TreeError>(())
//! ```
//!
//! # Implementation
//!
//! Queries are expressed as shuttles driven down the tree by a generic walker; inserts fill
//! leaves in place and split them when a packed structure runs out of block space. Reference
//! counts of shared blocks are kept by the store and adjusted when a transaction commits.

#![forbid(unsafe_code)]
#![forbid(keyword_idents)]
#![forbid(non_ascii_idents)]
#![forbid(unreachable_pub)]
#![warn(clippy::all)]
#![warn(clippy::cargo)]
#![warn(clippy::pedantic)]
// Enable coverage attributes for nightly builds.
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod block;
mod error;
mod raw;
mod walker;

pub mod config;
pub mod packed;
pub mod schema;
pub mod store;
pub mod tree;

pub use block::{Block, BlockId};
pub use config::{MergePolicy, StoreConfig, TreeConfig};
pub use error::{Result, TreeError};
pub use packed::SearchType;
pub use raw::{check_store, CheckReport, Severity, Summary};
pub use schema::{Column, ColumnKind, Combinator, Entry, Schema, SchemaRegistry, StreamKind};
pub use store::{BlockStore, MemoryStore};
pub use tree::{BatchProducer, Chunk, Entries, IterProducer, RunProducer, SelectResult, SkipResult, SliceProducer, Tree};
