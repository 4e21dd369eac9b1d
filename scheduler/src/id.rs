// id.rs — Stable statement identifiers
//
// Every statement in a procedure carries a `NodeId`. Edits keep the id of
// each node they move or rewrite and hand out fresh ids for copies, so an
// id names "the same statement" across all versions of one lineage. Cursor
// forwarding is id re-resolution against the newer version.

use serde::Serialize;

/// Stable identifier for a statement node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub u32);

/// Allocator for statement ids. Produces monotonically increasing ids, so a
/// fresh id never collides with one used by an earlier version.
#[derive(Debug, Clone, Default)]
pub struct NodeIdAllocator {
    next: u32,
}

impl NodeIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume allocation after `next - 1`.
    pub fn starting_at(next: u32) -> Self {
        Self { next }
    }

    pub fn alloc(&mut self) -> NodeId {
        let id = NodeId(self.next);
        self.next += 1;
        id
    }

    /// The id the next call to `alloc` will return.
    pub fn peek(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let mut ids = NodeIdAllocator::new();
        assert_eq!(ids.alloc(), NodeId(0));
        assert_eq!(ids.alloc(), NodeId(1));
        assert_eq!(ids.peek(), 2);
    }

    #[test]
    fn resume_after_existing_ids() {
        let mut ids = NodeIdAllocator::starting_at(40);
        assert_eq!(ids.alloc(), NodeId(40));
    }
}
