//! Persist the hashes and leaves of a virtual Merkle tree in a path-addressed hybrid store.
//!
//! A table ([source::DataSource]) combines three log-structured stores:
//!
//! * [hashes]: fixed-height subtrees of hashes ("hash chunks"), kept in memory below a
//!   configurable path threshold and on disk above it.
//! * [keys]: a half-disk hash map resolving arbitrary keys to leaf paths.
//! * [leaves]: the key and value of every live leaf, addressed by path.
//!
//! Every store appends to immutable [files] and resolves records through an in-memory
//! [index]. Stale records are reclaimed in the background by [compaction].
//!
//! # Status
//!
//! `commonware-merkledb` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

pub mod compaction;
pub mod files;
pub mod hashes;
pub mod index;
pub mod keys;
pub mod leaves;
pub mod path;
pub mod source;
pub mod store;
