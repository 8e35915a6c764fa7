//! Arithmetic over paths in a complete binary tree.
//!
//! Paths number the nodes of the tree breadth-first, starting with the root at `0`:
//!
//! ```text
//!              0
//!        1           2
//!     3     4     5     6
//!    7 8   9 10 11 12 13 14
//! ```
//!
//! The rank of a path is its distance from the root. Paths at rank `r` occupy `2^r - 1..=2^(r+1) - 2`.

/// The root of the tree.
pub const ROOT_PATH: u64 = 0;

/// The deepest rank a path may have.
pub const MAX_RANK: u32 = 61;

/// The largest valid path (the right-most path at [MAX_RANK]).
///
/// Paths above this value cannot have their children or their grandchildren computed
/// without overflowing, so they are rejected everywhere.
pub const MAX_PATH: u64 = (1 << (MAX_RANK + 1)) - 2;

/// Returns true if `path` is addressable.
#[inline]
pub fn is_valid(path: u64) -> bool {
    path <= MAX_PATH
}

/// Returns the rank (distance from the root) of `path`.
#[inline]
pub fn rank(path: u64) -> u32 {
    63 - (path + 1).leading_zeros()
}

/// Returns the parent of `path`, or `None` for the root.
#[inline]
pub fn parent(path: u64) -> Option<u64> {
    if path == ROOT_PATH {
        return None;
    }
    Some((path - 1) >> 1)
}

/// Returns the left child of `path`.
#[inline]
pub fn left_child(path: u64) -> u64 {
    (path << 1) + 1
}

/// Returns the right child of `path`.
#[inline]
pub fn right_child(path: u64) -> u64 {
    (path << 1) + 2
}

/// Returns true if `path` is the left child of its parent.
#[inline]
pub fn is_left(path: u64) -> bool {
    path & 1 == 1
}

/// Returns the left-most descendant of `path` that is `levels` ranks below it.
#[inline]
pub fn left_grand_child(path: u64, levels: u32) -> u64 {
    ((path + 1) << levels) - 1
}

/// Returns the right-most descendant of `path` that is `levels` ranks below it.
#[inline]
pub fn right_grand_child(path: u64, levels: u32) -> u64 {
    ((path + 2) << levels) - 2
}

/// Returns the ancestor of `path` that is `levels` ranks above it.
#[inline]
pub fn grand_parent(path: u64, levels: u32) -> u64 {
    ((path + 1) >> levels) - 1
}

/// Returns the left-most path at `rank`.
#[inline]
pub fn first_at_rank(rank: u32) -> u64 {
    left_grand_child(ROOT_PATH, rank)
}

/// Returns the right-most path at `rank`.
#[inline]
pub fn last_at_rank(rank: u32) -> u64 {
    right_grand_child(ROOT_PATH, rank)
}
