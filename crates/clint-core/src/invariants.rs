//! Red-black invariants
//!
//! Runtime-checkable structure assertions for [`RbTree`]. Used by unit
//! tests, the proptest sequences and `Registry::check_invariants`.
//!
//! # Invariants
//!
//! 1. **Black Root**: the root node is black
//! 2. **No Red-Red**: no red node has a red child
//! 3. **Black Height**: every root-to-leaf path crosses the same number of black nodes
//! 4. **Parent Links**: every child points back at its parent
//! 5. **Ordering**: in-order keys strictly increase
//! 6. **Length**: the reachable node count matches `len()`

use core::fmt::Debug;

use crate::error::TreeViolation;
use crate::tree::{Color, NodeId, RbTree};

/// Check every invariant.
///
/// Returns the black height of the tree (black nodes on any root-to-leaf
/// path, not counting the empty leaves).
pub fn check_red_black<K: Ord + Debug, V>(tree: &RbTree<K, V>) -> Result<usize, TreeViolation> {
    if tree.is_red(tree.root()) {
        return Err(TreeViolation::RedRoot);
    }
    if let Some(root) = tree.root() {
        if tree.parent(root).is_some() {
            return Err(TreeViolation::BrokenParentLink {
                node: describe(tree, root),
            });
        }
    }

    let (height, found) = match tree.root() {
        Some(root) => check_subtree(tree, root)?,
        None => (0, 0),
    };

    if found != tree.len() {
        return Err(TreeViolation::LengthMismatch {
            expected: tree.len(),
            found,
        });
    }

    check_ordering(tree)?;
    Ok(height)
}

/// Returns (black height, node count) of the subtree rooted at `id`.
fn check_subtree<K: Ord + Debug, V>(
    tree: &RbTree<K, V>,
    id: NodeId,
) -> Result<(usize, usize), TreeViolation> {
    let red = tree.color(id) == Color::Red;
    let mut heights = [0usize; 2];
    let mut count = 1;

    for (slot, child) in [tree.left(id), tree.right(id)].into_iter().enumerate() {
        let Some(child) = child else { continue };
        if tree.parent(child) != Some(id) {
            return Err(TreeViolation::BrokenParentLink {
                node: describe(tree, child),
            });
        }
        if red && tree.color(child) == Color::Red {
            return Err(TreeViolation::RedRedEdge {
                node: describe(tree, id),
            });
        }
        let (h, n) = check_subtree(tree, child)?;
        heights[slot] = h;
        count += n;
    }

    if heights[0] != heights[1] {
        return Err(TreeViolation::BlackHeightMismatch {
            node: describe(tree, id),
            left: heights[0],
            right: heights[1],
        });
    }

    Ok((heights[0] + usize::from(!red), count))
}

fn check_ordering<K: Ord + Debug, V>(tree: &RbTree<K, V>) -> Result<(), TreeViolation> {
    let mut prev: Option<&K> = None;
    for (key, _) in tree.iter() {
        if let Some(p) = prev {
            if p >= key {
                return Err(TreeViolation::OutOfOrder {
                    node: format!("{:?}", key),
                });
            }
        }
        prev = Some(key);
    }
    Ok(())
}

fn describe<K: Ord + Debug, V>(tree: &RbTree<K, V>, id: NodeId) -> String {
    match tree.key(id) {
        Some(key) => format!("{:?}", key),
        None => format!("{:?}", id),
    }
}


// ============================================================================
// Kani proofs for invariants
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: Any short insert/remove sequence keeps the tree balanced
    #[kani::proof]
    #[kani::unwind(6)]
    fn insert_remove_maintains_invariants() {
        let mut tree = RbTree::new();
        for _ in 0..4 {
            let key: u8 = kani::any();
            if kani::any() {
                let _ = tree.insert(key, ());
            } else {
                tree.remove(&key);
            }
        }
        kani::assert(
            check_red_black(&tree).is_ok(),
            "Red-black invariants hold after any operation sequence",
        );
    }

    /// Proof: A rejected duplicate insert leaves the length unchanged
    #[kani::proof]
    #[kani::unwind(4)]
    fn duplicate_insert_is_rejected() {
        let mut tree = RbTree::new();
        let key: u8 = kani::any();
        let _ = tree.insert(key, 0u8);
        let before = tree.len();
        kani::assert(tree.insert(key, 1).is_err(), "Duplicate keys are rejected");
        kani::assert(tree.len() == before, "Length is unchanged");
    }
}
