//! Arena-backed red-black tree
//!
//! Ordered map from keys to values, laid out as a slab of nodes addressed
//! by [`NodeId`]. Links are indices, so rotations and erasure never move a
//! node: an id stays valid for its node until that node is erased.
//!
//! The algorithms are the classic ones (insert/delete fixup with left and
//! right rotations). Missing children are `None` and count as black.
//!
//! # Invariants (checked by [`crate::invariants::check_red_black`])
//!
//! 1. **Black root**
//! 2. **No red-red edge**: a red node never has a red parent
//! 3. **Equal black height** on every root-to-leaf path
//! 4. **Ordering**: in-order traversal yields strictly increasing keys

use core::cmp::Ordering;

/// Stable index of a node inside one tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Color {
    Red,
    Black,
}

struct Node<K, V> {
    key: K,
    value: V,
    color: Color,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
}

/// Red-black tree with unique keys.
pub struct RbTree<K, V> {
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<NodeId>,
    root: Option<NodeId>,
    len: usize,
}

impl<K: Ord, V> Default for RbTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> RbTree<K, V> {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Root node, if any.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Point lookup.
    pub fn find(&self, key: &K) -> Option<NodeId> {
        let mut cur = self.root;
        while let Some(id) = cur {
            let node = self.node(id);
            cur = match key.cmp(&node.key) {
                Ordering::Equal => return Some(id),
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
            };
        }
        None
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.find(key).map(|id| &self.node(id).value)
    }

    /// Mutable value stored under `key`.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let id = self.find(key)?;
        Some(&mut self.node_mut(id).value)
    }

    /// Key of a live node.
    pub fn key(&self, id: NodeId) -> Option<&K> {
        self.slot(id).map(|n| &n.key)
    }

    /// Insert a new key.
    ///
    /// Keys are unique: if `key` is already present nothing changes and the
    /// value is handed back.
    pub fn insert(&mut self, key: K, value: V) -> Result<NodeId, V> {
        let mut parent = None;
        let mut go_left = false;
        let mut cur = self.root;
        while let Some(id) = cur {
            let node = self.node(id);
            parent = Some(id);
            match key.cmp(&node.key) {
                Ordering::Equal => return Err(value),
                Ordering::Less => {
                    go_left = true;
                    cur = node.left;
                }
                Ordering::Greater => {
                    go_left = false;
                    cur = node.right;
                }
            }
        }

        let id = self.alloc(Node {
            key,
            value,
            color: Color::Red,
            parent,
            left: None,
            right: None,
        });
        match parent {
            None => self.root = Some(id),
            Some(p) if go_left => self.node_mut(p).left = Some(id),
            Some(p) => self.node_mut(p).right = Some(id),
        }
        self.len += 1;
        self.insert_fixup(id);
        Ok(id)
    }

    /// Remove the node `id`, returning its entry. Stale ids return `None`.
    pub fn erase(&mut self, z: NodeId) -> Option<(K, V)> {
        self.slot(z)?;

        let mut removed_color = self.color(z);
        let x;
        let x_parent;

        match (self.left(z), self.right(z)) {
            (None, right) => {
                x = right;
                x_parent = self.parent(z);
                self.transplant(z, right);
            }
            (left, None) => {
                x = left;
                x_parent = self.parent(z);
                self.transplant(z, left);
            }
            (Some(z_left), Some(z_right)) => {
                // Successor y takes z's place; y has no left child
                let y = self.minimum(z_right);
                removed_color = self.color(y);
                x = self.right(y);
                if self.parent(y) == Some(z) {
                    x_parent = Some(y);
                } else {
                    x_parent = self.parent(y);
                    self.transplant(y, x);
                    self.node_mut(y).right = Some(z_right);
                    self.node_mut(z_right).parent = Some(y);
                }
                self.transplant(z, Some(y));
                self.node_mut(y).left = Some(z_left);
                self.node_mut(z_left).parent = Some(y);
                let z_color = self.color(z);
                self.node_mut(y).color = z_color;
            }
        }

        if removed_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }

        self.len -= 1;
        let node = self.slots[z.index()].take()?;
        self.free.push(z);
        Some((node.key, node.value))
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let id = self.find(key)?;
        self.erase(id).map(|(_, v)| v)
    }

    /// Smallest key.
    pub fn first(&self) -> Option<NodeId> {
        self.root.map(|r| self.minimum(r))
    }

    /// In-order successor.
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        if let Some(right) = self.slot(id)?.right {
            return Some(self.minimum(right));
        }
        let mut child = id;
        let mut parent = self.parent(child);
        while let Some(p) = parent {
            if self.left(p) == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.parent(p);
        }
        None
    }

    /// In-order iterator over entries.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            tree: self,
            next: self.first(),
        }
    }

    // ------------------------------------------------------------------
    // Link accessors (also used by the invariant checker)
    // ------------------------------------------------------------------

    pub(crate) fn color(&self, id: NodeId) -> Color {
        self.node(id).color
    }

    pub(crate) fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub(crate) fn left(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).left
    }

    pub(crate) fn right(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).right
    }

    pub(crate) fn is_red(&self, id: Option<NodeId>) -> bool {
        matches!(id, Some(id) if self.color(id) == Color::Red)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn slot(&self, id: NodeId) -> Option<&Node<K, V>> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    fn node(&self, id: NodeId) -> &Node<K, V> {
        match self.slot(id) {
            Some(node) => node,
            None => unreachable!("dangling tree link {:?}", id),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<K, V> {
        match self.slots.get_mut(id.index()).and_then(Option::as_mut) {
            Some(node) => node,
            None => unreachable!("dangling tree link {:?}", id),
        }
    }

    fn set_color(&mut self, id: Option<NodeId>, color: Color) {
        if let Some(id) = id {
            self.node_mut(id).color = color;
        }
    }

    fn alloc(&mut self, node: Node<K, V>) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id.index()] = Some(node);
                id
            }
            None => {
                let id = NodeId(self.slots.len() as u32);
                self.slots.push(Some(node));
                id
            }
        }
    }

    fn minimum(&self, mut id: NodeId) -> NodeId {
        while let Some(left) = self.left(id) {
            id = left;
        }
        id
    }

    /// Put `v` where `u` hangs from its parent.
    fn transplant(&mut self, u: NodeId, v: Option<NodeId>) {
        let up = self.parent(u);
        match up {
            None => self.root = v,
            Some(p) if self.left(p) == Some(u) => self.node_mut(p).left = v,
            Some(p) => self.node_mut(p).right = v,
        }
        if let Some(v) = v {
            self.node_mut(v).parent = up;
        }
    }

    fn rotate_left(&mut self, x: NodeId) {
        let Some(y) = self.right(x) else { return };
        let y_left = self.left(y);
        self.node_mut(x).right = y_left;
        if let Some(yl) = y_left {
            self.node_mut(yl).parent = Some(x);
        }
        self.transplant(x, Some(y));
        self.node_mut(y).left = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn rotate_right(&mut self, x: NodeId) {
        let Some(y) = self.left(x) else { return };
        let y_right = self.right(y);
        self.node_mut(x).left = y_right;
        if let Some(yr) = y_right {
            self.node_mut(yr).parent = Some(x);
        }
        self.transplant(x, Some(y));
        self.node_mut(y).right = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn insert_fixup(&mut self, mut z: NodeId) {
        while let Some(p) = self.parent(z) {
            if self.color(p) == Color::Black {
                break;
            }
            // A red parent is never the root, so the grandparent exists
            let Some(g) = self.parent(p) else { break };

            if self.left(g) == Some(p) {
                let uncle = self.right(g);
                if self.is_red(uncle) {
                    self.set_color(Some(p), Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(Some(g), Color::Red);
                    z = g;
                } else {
                    if self.right(p) == Some(z) {
                        z = p;
                        self.rotate_left(z);
                    }
                    let Some(p) = self.parent(z) else { break };
                    let Some(g) = self.parent(p) else { break };
                    self.set_color(Some(p), Color::Black);
                    self.set_color(Some(g), Color::Red);
                    self.rotate_right(g);
                }
            } else {
                let uncle = self.left(g);
                if self.is_red(uncle) {
                    self.set_color(Some(p), Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(Some(g), Color::Red);
                    z = g;
                } else {
                    if self.left(p) == Some(z) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let Some(p) = self.parent(z) else { break };
                    let Some(g) = self.parent(p) else { break };
                    self.set_color(Some(p), Color::Black);
                    self.set_color(Some(g), Color::Red);
                    self.rotate_left(g);
                }
            }
        }
        self.set_color(self.root, Color::Black);
    }

    /// Restore the invariants after removing a black node.
    ///
    /// `x` carries the extra black and may be `None`, so its parent is
    /// tracked separately.
    fn delete_fixup(&mut self, mut x: Option<NodeId>, mut x_parent: Option<NodeId>) {
        while x != self.root && !self.is_red(x) {
            let Some(p) = x_parent else { break };

            if self.left(p) == x {
                let mut w = self.right(p);
                if self.is_red(w) {
                    self.set_color(w, Color::Black);
                    self.set_color(Some(p), Color::Red);
                    self.rotate_left(p);
                    w = self.right(p);
                }
                let Some(mut s) = w else {
                    x = Some(p);
                    x_parent = self.parent(p);
                    continue;
                };
                if !self.is_red(self.left(s)) && !self.is_red(self.right(s)) {
                    self.set_color(Some(s), Color::Red);
                    x = Some(p);
                    x_parent = self.parent(p);
                } else {
                    if !self.is_red(self.right(s)) {
                        self.set_color(self.left(s), Color::Black);
                        self.set_color(Some(s), Color::Red);
                        self.rotate_right(s);
                        match self.right(p) {
                            Some(next) => s = next,
                            None => break,
                        }
                    }
                    let p_color = self.color(p);
                    self.set_color(Some(s), p_color);
                    self.set_color(Some(p), Color::Black);
                    self.set_color(self.right(s), Color::Black);
                    self.rotate_left(p);
                    x = self.root;
                    x_parent = None;
                }
            } else {
                let mut w = self.left(p);
                if self.is_red(w) {
                    self.set_color(w, Color::Black);
                    self.set_color(Some(p), Color::Red);
                    self.rotate_right(p);
                    w = self.left(p);
                }
                let Some(mut s) = w else {
                    x = Some(p);
                    x_parent = self.parent(p);
                    continue;
                };
                if !self.is_red(self.left(s)) && !self.is_red(self.right(s)) {
                    self.set_color(Some(s), Color::Red);
                    x = Some(p);
                    x_parent = self.parent(p);
                } else {
                    if !self.is_red(self.left(s)) {
                        self.set_color(self.right(s), Color::Black);
                        self.set_color(Some(s), Color::Red);
                        self.rotate_left(s);
                        match self.left(p) {
                            Some(next) => s = next,
                            None => break,
                        }
                    }
                    let p_color = self.color(p);
                    self.set_color(Some(s), p_color);
                    self.set_color(Some(p), Color::Black);
                    self.set_color(self.left(s), Color::Black);
                    self.rotate_right(p);
                    x = self.root;
                    x_parent = None;
                }
            }
        }
        self.set_color(x, Color::Black);
    }
}

/// In-order iterator returned by [`RbTree::iter`].
pub struct Iter<'a, K, V> {
    tree: &'a RbTree<K, V>,
    next: Option<NodeId>,
}

impl<'a, K: Ord, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        self.next = self.tree.next(id);
        let node = self.tree.slot(id)?;
        Some((&node.key, &node.value))
    }
}
