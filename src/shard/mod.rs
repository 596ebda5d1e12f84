//! Shards - Derived Persistent Indices
//!
//! A shard indexes one attribute of the directory objects selected by its
//! filter, keyed by another attribute.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  IndexStore (one LMDB env)                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐    │
//! │  │ uniqueMembers│  │  memberUids  │  │  groupsOfMember  │ …  │
//! │  │ dn -> {dn}   │  │ dn -> {uid}  │  │  dn -> {dn} (rev) │    │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘    │
//! │            one Reader spans every named database              │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod definition;
mod index;
mod proptest;
mod store;

pub use definition::ShardDefinition;
pub use index::{Contribution, Shard};
pub use store::{IndexDb, IndexStore, Reader, ReaderHandle};
