//! Persistent Sparse Map
//!
//! A height-balanced binary search tree keyed by a 64-bit index, usually the
//! hash of an external key. Values are arbitrary value words; iteration is
//! in ascending key order. Like the ordered list, every mutating operation
//! path-copies and returns a new root.
//!
//! Storing the none value is indistinguishable from absence: `set_at` with
//! none is a no-op and `has` reports false for it.
//!
//! The iterator is a zipper: the current node plus the pending-ancestor
//! stack, encoded as a linked list of iterator cells so iteration itself
//! participates in garbage collection.

use crate::cell::{
    Cell, CellBody, SparseIterNode, SparseNode, cell_value, pack_count_height, unpack_count,
    unpack_height,
};
use crate::context::Context;
use proto_core::{PointerTag, Value};
use std::ptr;

// =============================================================================
// Tree helpers
// =============================================================================

#[inline(always)]
fn node<'a>(cell: *mut Cell) -> &'a SparseNode {
    unsafe {
        match &(*cell).body {
            CellBody::SparseMap(n) => n,
            _ => unreachable!("sparse map cell expected"),
        }
    }
}

#[inline(always)]
fn height(cell: *mut Cell) -> u8 {
    if cell.is_null() {
        0
    } else {
        unpack_height(node(cell).count_height)
    }
}

#[inline(always)]
fn count(cell: *mut Cell) -> u64 {
    if cell.is_null() {
        0
    } else {
        unpack_count(node(cell).count_height)
    }
}

#[inline(always)]
fn subtree_hash(cell: *mut Cell) -> u64 {
    if cell.is_null() { 0 } else { node(cell).hash }
}

#[inline(always)]
fn balance(cell: *mut Cell) -> i32 {
    if cell.is_null() {
        0
    } else {
        height(node(cell).next) as i32 - height(node(cell).previous) as i32
    }
}

fn new_node(
    ctx: &mut Context,
    key: u64,
    value: Value,
    previous: *mut Cell,
    next: *mut Cell,
) -> *mut Cell {
    let value_hash = if value.is_none() { 0 } else { value.hash() };
    let hash = key ^ value_hash ^ subtree_hash(previous) ^ subtree_hash(next);
    let n = 1 + count(previous) + count(next);
    let h = 1 + height(previous).max(height(next));
    ctx.alloc_cell(CellBody::SparseMap(SparseNode {
        key,
        value,
        previous,
        next,
        hash,
        count_height: pack_count_height(n, h),
    }))
}

/// The empty map is a cell so it can travel as a value word; its count is 0.
fn empty(ctx: &mut Context) -> *mut Cell {
    ctx.alloc_cell(CellBody::SparseMap(SparseNode {
        key: 0,
        value: Value::NONE,
        previous: ptr::null_mut(),
        next: ptr::null_mut(),
        hash: 0,
        count_height: pack_count_height(0, 1),
    }))
}

fn rotate_right(ctx: &mut Context, y: *mut Cell) -> *mut Cell {
    let yn = node(y);
    let xn = node(yn.previous);
    let new_y = new_node(ctx, yn.key, yn.value, xn.next, yn.next);
    new_node(ctx, xn.key, xn.value, xn.previous, new_y)
}

fn rotate_left(ctx: &mut Context, x: *mut Cell) -> *mut Cell {
    let xn = node(x);
    let yn = node(xn.next);
    let new_x = new_node(ctx, xn.key, xn.value, xn.previous, yn.previous);
    new_node(ctx, yn.key, yn.value, new_x, yn.next)
}

fn rebalance(ctx: &mut Context, cell: *mut Cell) -> *mut Cell {
    if cell.is_null() {
        return cell;
    }
    let b = balance(cell);
    if b < -1 {
        if balance(node(cell).previous) <= 0 {
            rotate_right(ctx, cell)
        } else {
            let n = node(cell);
            let new_prev = rotate_left(ctx, n.previous);
            let replaced = new_node(ctx, n.key, n.value, new_prev, n.next);
            rotate_right(ctx, replaced)
        }
    } else if b > 1 {
        if balance(node(cell).next) >= 0 {
            rotate_left(ctx, cell)
        } else {
            let n = node(cell);
            let new_next = rotate_right(ctx, n.next);
            let replaced = new_node(ctx, n.key, n.value, n.previous, new_next);
            rotate_left(ctx, replaced)
        }
    } else {
        cell
    }
}

fn find(tree: *mut Cell, key: u64) -> Option<Value> {
    let mut current = tree;
    while !current.is_null() {
        let n = node(current);
        if key == n.key {
            return Some(n.value);
        }
        current = if key < n.key { n.previous } else { n.next };
    }
    None
}

fn set_tree(ctx: &mut Context, tree: *mut Cell, key: u64, value: Value) -> *mut Cell {
    if tree.is_null() {
        return new_node(ctx, key, value, ptr::null_mut(), ptr::null_mut());
    }
    let n = node(tree);
    let replaced = if key < n.key {
        let new_prev = set_tree(ctx, n.previous, key, value);
        new_node(ctx, n.key, n.value, new_prev, n.next)
    } else if key > n.key {
        let new_next = set_tree(ctx, n.next, key, value);
        new_node(ctx, n.key, n.value, n.previous, new_next)
    } else {
        if n.value == value {
            return tree;
        }
        new_node(ctx, key, value, n.previous, n.next)
    };
    rebalance(ctx, replaced)
}

fn remove_tree(ctx: &mut Context, tree: *mut Cell, key: u64) -> *mut Cell {
    if tree.is_null() {
        return tree;
    }
    let n = node(tree);
    let replaced = if key < n.key {
        if n.previous.is_null() {
            return tree;
        }
        let new_prev = remove_tree(ctx, n.previous, key);
        if new_prev == n.previous {
            return tree;
        }
        new_node(ctx, n.key, n.value, new_prev, n.next)
    } else if key > n.key {
        if n.next.is_null() {
            return tree;
        }
        let new_next = remove_tree(ctx, n.next, key);
        if new_next == n.next {
            return tree;
        }
        new_node(ctx, n.key, n.value, n.previous, new_next)
    } else {
        if n.previous.is_null() {
            return n.next;
        }
        if n.next.is_null() {
            return n.previous;
        }
        // Two children: splice in the in-order successor.
        let mut successor = n.next;
        while !node(successor).previous.is_null() {
            successor = node(successor).previous;
        }
        let s = node(successor);
        let new_next = remove_tree(ctx, n.next, s.key);
        new_node(ctx, s.key, s.value, n.previous, new_next)
    };
    rebalance(ctx, replaced)
}

/// The pair at position `offset` in ascending key order.
fn pair_at(tree: *mut Cell, mut offset: u64) -> Option<(u64, Value)> {
    let mut current = tree;
    while !current.is_null() {
        let n = node(current);
        let left_count = count(n.previous);
        if offset == left_count {
            return Some((n.key, n.value));
        }
        if offset < left_count {
            current = n.previous;
        } else {
            offset -= left_count + 1;
            current = n.next;
        }
    }
    None
}

fn process_tree(tree: *mut Cell, callback: &mut dyn FnMut(u64, Value)) {
    if tree.is_null() {
        return;
    }
    let n = node(tree);
    process_tree(n.previous, callback);
    if !n.value.is_none() {
        callback(n.key, n.value);
    }
    process_tree(n.next, callback);
}

// =============================================================================
// ProtoSparseMap
// =============================================================================

/// Handle to a persistent sparse map cell.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProtoSparseMap(pub(crate) *mut Cell);

impl ProtoSparseMap {
    /// A new empty map.
    pub fn new(ctx: &mut Context) -> ProtoSparseMap {
        ProtoSparseMap(empty(ctx))
    }

    pub(crate) fn from_cell(cell: *mut Cell) -> ProtoSparseMap {
        debug_assert!(matches!(unsafe { &(*cell).body }, CellBody::SparseMap(_)));
        ProtoSparseMap(cell)
    }

    pub(crate) fn cell(self) -> *mut Cell {
        self.0
    }

    /// The map as a tagged value word.
    pub fn as_value(self) -> Value {
        unsafe { cell_value(self.0) }
    }

    /// Recover a map handle from a value word; `None` for any other tag.
    pub fn from_value(v: Value) -> Option<ProtoSparseMap> {
        if v.tag() == PointerTag::SparseMap as u8 && !v.is_none() {
            Some(ProtoSparseMap(v.cell_address() as *mut Cell))
        } else {
            None
        }
    }

    fn tree(self) -> *mut Cell {
        if count(self.0) == 0 { ptr::null_mut() } else { self.0 }
    }

    pub fn get_size(self) -> u64 {
        count(self.0)
    }

    pub fn is_empty(self) -> bool {
        self.get_size() == 0
    }

    pub fn has(self, key: u64) -> bool {
        matches!(find(self.tree(), key), Some(v) if !v.is_none())
    }

    /// The value under `key`, or none.
    pub fn get_at(self, key: u64) -> Value {
        find(self.tree(), key).unwrap_or(Value::NONE)
    }

    /// A new map with `key` bound to `value`. Binding the none value is a
    /// no-op; binding an already-present identical value returns the map
    /// unchanged.
    pub fn set_at(self, ctx: &mut Context, key: u64, value: Value) -> ProtoSparseMap {
        if value.is_none() {
            return self;
        }
        ProtoSparseMap(set_tree(ctx, self.tree(), key, value))
    }

    /// A new map without `key`; absent keys return the map unchanged.
    pub fn remove_at(self, ctx: &mut Context, key: u64) -> ProtoSparseMap {
        let tree = self.tree();
        let removed = remove_tree(ctx, tree, key);
        if removed == tree {
            self
        } else if removed.is_null() {
            ProtoSparseMap(empty(ctx))
        } else {
            ProtoSparseMap(removed)
        }
    }

    /// The `(key, value)` pair at `offset` in ascending key order, or none.
    pub fn get_at_offset(self, offset: i64) -> (u64, Value) {
        let size = self.get_size();
        let resolved = if offset < 0 { offset + size as i64 } else { offset };
        if resolved < 0 || resolved as u64 >= size {
            return (0, Value::NONE);
        }
        pair_at(self.tree(), resolved as u64).unwrap_or((0, Value::NONE))
    }

    /// Key-wise equality of the two maps' contents.
    pub fn is_equal(self, other: ProtoSparseMap) -> bool {
        if self.get_size() != other.get_size() {
            return false;
        }
        let mut equal = true;
        self.process_elements(&mut |key, value| {
            if other.get_at(key) != value {
                equal = false;
            }
        });
        equal
    }

    /// In-order `(key, value)` visit. The collector uses this as a root-scan
    /// driver.
    pub fn process_elements(self, callback: &mut dyn FnMut(u64, Value)) {
        process_tree(self.tree(), callback);
    }

    /// In-order value-only visit.
    pub fn process_values(self, callback: &mut dyn FnMut(Value)) {
        process_tree(self.tree(), &mut |_, v| callback(v));
    }

    /// A zipper iterator positioned at the smallest key.
    pub fn get_iterator(self, ctx: &mut Context) -> ProtoSparseMapIterator {
        ProtoSparseMapIterator::descend(ctx, self.tree(), ptr::null_mut())
    }

    /// XOR-combined content hash of the tree.
    pub(crate) fn content_hash(self) -> u64 {
        subtree_hash(self.tree())
    }
}

// =============================================================================
// Iterator
// =============================================================================

/// Zipper iterator cell: `current` is the node whose pair `next_key` /
/// `next_value` yield; `queue` is the pending ancestor stack.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct ProtoSparseMapIterator(pub(crate) *mut Cell);

impl ProtoSparseMapIterator {
    fn new(ctx: &mut Context, current: *mut Cell, queue: *mut Cell) -> ProtoSparseMapIterator {
        ProtoSparseMapIterator(
            ctx.alloc_cell(CellBody::SparseMapIter(SparseIterNode { current, queue })),
        )
    }

    /// Build the iterator chain down the left spine of `tree`, on top of
    /// `queue`.
    fn descend(ctx: &mut Context, tree: *mut Cell, queue: *mut Cell) -> ProtoSparseMapIterator {
        let mut queue = queue;
        let mut current = tree;
        while !current.is_null() && !node(current).previous.is_null() {
            queue = ProtoSparseMapIterator::new(ctx, current, queue).0;
            current = node(current).previous;
        }
        ProtoSparseMapIterator::new(ctx, current, queue)
    }

    fn iter_node<'a>(self) -> &'a SparseIterNode {
        unsafe {
            match &(*self.0).body {
                CellBody::SparseMapIter(n) => n,
                _ => unreachable!("sparse map iterator cell expected"),
            }
        }
    }

    pub fn as_value(self) -> Value {
        unsafe { cell_value(self.0) }
    }

    pub fn has_next(self) -> bool {
        !self.iter_node().current.is_null()
    }

    /// The current key without advancing.
    pub fn next_key(self) -> u64 {
        let n = self.iter_node();
        if n.current.is_null() { 0 } else { node(n.current).key }
    }

    /// The current value without advancing.
    pub fn next_value(self) -> Value {
        let n = self.iter_node();
        if n.current.is_null() {
            Value::NONE
        } else {
            node(n.current).value
        }
    }

    /// A new iterator at the next pair in key order: the right subtree's
    /// smallest key if there is one, otherwise the nearest pending ancestor.
    pub fn advance(self, ctx: &mut Context) -> ProtoSparseMapIterator {
        let n = self.iter_node();
        if n.current.is_null() {
            return self;
        }
        let right = node(n.current).next;
        if !right.is_null() {
            ProtoSparseMapIterator::descend(ctx, right, n.queue)
        } else if n.queue.is_null() {
            ProtoSparseMapIterator::new(ctx, ptr::null_mut(), ptr::null_mut())
        } else {
            ProtoSparseMapIterator(n.queue)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
