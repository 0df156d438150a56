//! Persistent Ordered List
//!
//! A height-balanced binary tree with path copying: every node carries its
//! value, both subtrees, a precomputed size and height, and an XOR-combined
//! content hash. The left-subtree count gives O(log n) positional access;
//! every mutating operation returns a new root and copies only the path it
//! touched.
//!
//! Bulk operations (splits, concatenation, slice removal) go through a
//! height-aware AVL join so the balance invariant holds after every
//! operation, not only after single-element updates.
//!
//! The empty list is itself a cell (so it can travel as a value word);
//! subtrees inside a non-empty tree use null for absence.

use crate::cell::{
    Cell, CellBody, ListIterNode, ListNode, cell_value, pack_count_height, unpack_count,
    unpack_height,
};
use crate::context::Context;
use proto_core::{PointerTag, Value};
use std::ptr;

// =============================================================================
// Tree helpers
// =============================================================================

#[inline(always)]
fn node<'a>(cell: *mut Cell) -> &'a ListNode {
    unsafe {
        match &(*cell).body {
            CellBody::List(n) => n,
            _ => unreachable!("list cell expected"),
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

fn new_node(ctx: &mut Context, value: Value, previous: *mut Cell, next: *mut Cell) -> *mut Cell {
    let value_hash = if value.is_none() { 0 } else { value.hash() };
    let hash = value_hash ^ subtree_hash(previous) ^ subtree_hash(next);
    let n = (if value.is_none() { 0 } else { 1 }) + count(previous) + count(next);
    let h = 1 + height(previous).max(height(next));
    ctx.alloc_cell(CellBody::List(ListNode {
        value,
        previous,
        next,
        hash,
        count_height: pack_count_height(n, h),
    }))
}

fn empty(ctx: &mut Context) -> *mut Cell {
    new_node(ctx, Value::NONE, ptr::null_mut(), ptr::null_mut())
}

fn rotate_right(ctx: &mut Context, y: *mut Cell) -> *mut Cell {
    let yn = node(y);
    let xn = node(yn.previous);
    let new_y = new_node(ctx, yn.value, xn.next, yn.next);
    new_node(ctx, xn.value, xn.previous, new_y)
}

fn rotate_left(ctx: &mut Context, x: *mut Cell) -> *mut Cell {
    let xn = node(x);
    let yn = node(xn.next);
    let new_x = new_node(ctx, xn.value, xn.previous, yn.previous);
    new_node(ctx, yn.value, new_x, yn.next)
}

/// Path-copying rebalance: rotations allocate new nodes, the originals stay
/// untouched. Children must each satisfy the AVL bound and differ in height
/// by at most two, which every caller guarantees.
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
            let replaced = new_node(ctx, n.value, new_prev, n.next);
            rotate_right(ctx, replaced)
        }
    } else if b > 1 {
        if balance(node(cell).next) >= 0 {
            rotate_left(ctx, cell)
        } else {
            let n = node(cell);
            let new_next = rotate_right(ctx, n.next);
            let replaced = new_node(ctx, n.value, n.previous, new_next);
            rotate_left(ctx, replaced)
        }
    } else {
        cell
    }
}

/// AVL join: the tree holding `left`, then `middle`, then `right`.
/// Recurses down the taller side so the result satisfies the AVL bound.
fn join(ctx: &mut Context, left: *mut Cell, middle: Value, right: *mut Cell) -> *mut Cell {
    if height(left) > height(right) + 1 {
        let n = node(left);
        let new_next = join(ctx, n.next, middle, right);
        let replaced = new_node(ctx, n.value, n.previous, new_next);
        rebalance(ctx, replaced)
    } else if height(right) > height(left) + 1 {
        let n = node(right);
        let new_prev = join(ctx, left, middle, n.previous);
        let replaced = new_node(ctx, n.value, new_prev, n.next);
        rebalance(ctx, replaced)
    } else {
        new_node(ctx, middle, left, right)
    }
}

/// Join without a middle element.
fn join_sides(ctx: &mut Context, left: *mut Cell, right: *mut Cell) -> *mut Cell {
    if left.is_null() {
        return right;
    }
    if right.is_null() {
        return left;
    }
    let last = get_at_tree(left, count(left) - 1);
    let trimmed = remove_tree(ctx, left, count(left) - 1);
    join(ctx, trimmed, last, right)
}

fn get_at_tree(tree: *mut Cell, mut index: u64) -> Value {
    let mut current = tree;
    while !current.is_null() {
        let n = node(current);
        let left_count = count(n.previous);
        if index == left_count {
            return n.value;
        }
        if index < left_count {
            current = n.previous;
        } else {
            index -= left_count + 1;
            current = n.next;
        }
    }
    Value::NONE
}

fn insert_tree(ctx: &mut Context, tree: *mut Cell, index: u64, value: Value) -> *mut Cell {
    if tree.is_null() {
        return new_node(ctx, value, ptr::null_mut(), ptr::null_mut());
    }
    let n = node(tree);
    let left_count = count(n.previous);
    let replaced = if index <= left_count {
        let new_prev = insert_tree(ctx, n.previous, index, value);
        new_node(ctx, n.value, new_prev, n.next)
    } else {
        let new_next = insert_tree(ctx, n.next, index - left_count - 1, value);
        new_node(ctx, n.value, n.previous, new_next)
    };
    rebalance(ctx, replaced)
}

fn set_tree(ctx: &mut Context, tree: *mut Cell, index: u64, value: Value) -> *mut Cell {
    let n = node(tree);
    let left_count = count(n.previous);
    if index == left_count {
        new_node(ctx, value, n.previous, n.next)
    } else if index < left_count {
        let new_prev = set_tree(ctx, n.previous, index, value);
        new_node(ctx, n.value, new_prev, n.next)
    } else {
        let new_next = set_tree(ctx, n.next, index - left_count - 1, value);
        new_node(ctx, n.value, n.previous, new_next)
    }
}

fn remove_tree(ctx: &mut Context, tree: *mut Cell, index: u64) -> *mut Cell {
    let n = node(tree);
    let left_count = count(n.previous);
    if index == left_count {
        join_sides(ctx, n.previous, n.next)
    } else if index < left_count {
        let new_prev = remove_tree(ctx, n.previous, index);
        let replaced = new_node(ctx, n.value, new_prev, n.next);
        rebalance(ctx, replaced)
    } else {
        let new_next = remove_tree(ctx, n.next, index - left_count - 1);
        let replaced = new_node(ctx, n.value, n.previous, new_next);
        rebalance(ctx, replaced)
    }
}

/// The first `keep` elements of the tree.
fn take_tree(ctx: &mut Context, tree: *mut Cell, keep: u64) -> *mut Cell {
    if tree.is_null() || keep == 0 {
        return ptr::null_mut();
    }
    if keep >= count(tree) {
        return tree;
    }
    let n = node(tree);
    let left_count = count(n.previous);
    if keep <= left_count {
        take_tree(ctx, n.previous, keep)
    } else {
        let new_next = take_tree(ctx, n.next, keep - left_count - 1);
        join(ctx, n.previous, n.value, new_next)
    }
}

/// The tree with its first `skip` elements removed.
fn skip_tree(ctx: &mut Context, tree: *mut Cell, skip: u64) -> *mut Cell {
    if tree.is_null() || skip == 0 {
        return tree;
    }
    if skip >= count(tree) {
        return ptr::null_mut();
    }
    let n = node(tree);
    let left_count = count(n.previous);
    if skip <= left_count {
        let new_prev = skip_tree(ctx, n.previous, skip);
        join(ctx, new_prev, n.value, n.next)
    } else {
        skip_tree(ctx, n.next, skip - left_count - 1)
    }
}

/// Resolve a possibly negative index against `size`; out of range is `None`.
#[inline]
fn resolve_index(index: i64, size: u64) -> Option<u64> {
    let resolved = if index < 0 { index + size as i64 } else { index };
    if resolved < 0 || resolved as u64 >= size {
        None
    } else {
        Some(resolved as u64)
    }
}

/// Resolve a possibly negative position, clamped into `[0, size]`.
#[inline]
fn clamp_position(index: i64, size: u64) -> u64 {
    let resolved = if index < 0 { index + size as i64 } else { index };
    resolved.clamp(0, size as i64) as u64
}

// =============================================================================
// ProtoList
// =============================================================================

/// Handle to a persistent ordered list cell.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProtoList(pub(crate) *mut Cell);

impl ProtoList {
    /// A new empty list.
    pub fn new(ctx: &mut Context) -> ProtoList {
        ProtoList(empty(ctx))
    }

    pub(crate) fn from_cell(cell: *mut Cell) -> ProtoList {
        debug_assert!(matches!(unsafe { &(*cell).body }, CellBody::List(_)));
        ProtoList(cell)
    }

    /// Wrap a possibly null subtree, materializing an empty cell for null.
    fn wrap(ctx: &mut Context, tree: *mut Cell) -> ProtoList {
        if tree.is_null() {
            ProtoList(empty(ctx))
        } else {
            ProtoList(tree)
        }
    }

    /// The list as a tagged value word.
    pub fn as_value(self) -> Value {
        unsafe { cell_value(self.0) }
    }

    /// Recover a list handle from a value word; `None` for any other tag.
    pub fn from_value(v: Value) -> Option<ProtoList> {
        if v.tag() == PointerTag::List as u8 && !v.is_none() {
            Some(ProtoList(v.cell_address() as *mut Cell))
        } else {
            None
        }
    }

    /// The tree as a subtree pointer: null when empty.
    fn tree(self) -> *mut Cell {
        if count(self.0) == 0 { ptr::null_mut() } else { self.0 }
    }

    pub fn get_size(self) -> u64 {
        count(self.0)
    }

    pub fn is_empty(self) -> bool {
        self.get_size() == 0
    }

    /// The value at `index` (negative indexes are relative to the size);
    /// none when out of range.
    pub fn get_at(self, index: i64) -> Value {
        match resolve_index(index, self.get_size()) {
            Some(i) => get_at_tree(self.tree(), i),
            None => Value::NONE,
        }
    }

    pub fn get_first(self) -> Value {
        self.get_at(0)
    }

    pub fn get_last(self) -> Value {
        self.get_at(-1)
    }

    /// Linear scan by value-word identity.
    pub fn has(self, value: Value) -> bool {
        let size = self.get_size();
        for i in 0..size {
            if get_at_tree(self.tree(), i) == value {
                return true;
            }
        }
        false
    }

    /// A new list with position `index` replaced; out-of-range indexes
    /// return the list unchanged.
    pub fn set_at(self, ctx: &mut Context, index: i64, value: Value) -> ProtoList {
        match resolve_index(index, self.get_size()) {
            Some(i) => ProtoList(set_tree(ctx, self.tree(), i, value)),
            None => self,
        }
    }

    /// A new list with `value` inserted at `index`; positions past the end
    /// append.
    pub fn insert_at(self, ctx: &mut Context, index: i64, value: Value) -> ProtoList {
        let position = clamp_position(index, self.get_size());
        ProtoList(insert_tree(ctx, self.tree(), position, value))
    }

    pub fn append_first(self, ctx: &mut Context, value: Value) -> ProtoList {
        ProtoList(insert_tree(ctx, self.tree(), 0, value))
    }

    pub fn append_last(self, ctx: &mut Context, value: Value) -> ProtoList {
        let size = self.get_size();
        ProtoList(insert_tree(ctx, self.tree(), size, value))
    }

    /// Concatenation; the side with the larger count keeps its tree as a
    /// subtree of the joined result.
    pub fn extend(self, ctx: &mut Context, other: ProtoList) -> ProtoList {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        ProtoList(join_sides(ctx, self.tree(), other.tree()))
    }

    /// The first `keep` elements.
    pub fn split_first(self, ctx: &mut Context, keep: i64) -> ProtoList {
        let keep = clamp_position(keep, self.get_size());
        let tree = take_tree(ctx, self.tree(), keep);
        ProtoList::wrap(ctx, tree)
    }

    /// Everything from position `skip` on.
    pub fn split_last(self, ctx: &mut Context, skip: i64) -> ProtoList {
        let skip = clamp_position(skip, self.get_size());
        let tree = skip_tree(ctx, self.tree(), skip);
        ProtoList::wrap(ctx, tree)
    }

    /// The elements in `[from, to)`.
    pub fn get_slice(self, ctx: &mut Context, from: i64, to: i64) -> ProtoList {
        let size = self.get_size();
        let from = clamp_position(from, size);
        let to = clamp_position(to, size);
        if to <= from {
            return ProtoList(empty(ctx));
        }
        let tail = skip_tree(ctx, self.tree(), from);
        let tree = take_tree(ctx, tail, to - from);
        ProtoList::wrap(ctx, tree)
    }

    pub fn remove_first(self, ctx: &mut Context) -> ProtoList {
        self.remove_at(ctx, 0)
    }

    pub fn remove_last(self, ctx: &mut Context) -> ProtoList {
        self.remove_at(ctx, -1)
    }

    /// A new list with position `index` removed; out-of-range indexes return
    /// the list unchanged.
    pub fn remove_at(self, ctx: &mut Context, index: i64) -> ProtoList {
        match resolve_index(index, self.get_size()) {
            Some(i) => {
                let tree = remove_tree(ctx, self.tree(), i);
                ProtoList::wrap(ctx, tree)
            }
            None => self,
        }
    }

    /// A new list without the elements in `[from, to)`.
    pub fn remove_slice(self, ctx: &mut Context, from: i64, to: i64) -> ProtoList {
        let size = self.get_size();
        let from = clamp_position(from, size);
        let to = clamp_position(to, size);
        if to <= from {
            return self;
        }
        let head = take_tree(ctx, self.tree(), from);
        let tail = skip_tree(ctx, self.tree(), to);
        let tree = join_sides(ctx, head, tail);
        ProtoList::wrap(ctx, tree)
    }

    /// An iterator cell positioned at the first element.
    pub fn get_iterator(self, ctx: &mut Context) -> ProtoListIterator {
        ProtoListIterator::new(ctx, self, 0)
    }

    /// XOR-combined content hash of the tree.
    pub(crate) fn content_hash(self) -> u64 {
        subtree_hash(self.tree())
    }

    /// Largest height difference violation in the tree; 0 for a valid AVL
    /// tree. Test support.
    #[cfg(test)]
    pub(crate) fn avl_violation(self) -> i32 {
        fn walk(cell: *mut Cell) -> i32 {
            if cell.is_null() {
                return 0;
            }
            let n = node(cell);
            let here = (balance(cell).abs() - 1).max(0);
            here.max(walk(n.previous)).max(walk(n.next))
        }
        walk(self.tree())
    }
}

// =============================================================================
// Iterator
// =============================================================================

/// Positional iterator cell over a list. `next` does not advance; `advance`
/// returns a new iterator at the following position.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct ProtoListIterator(pub(crate) *mut Cell);

impl ProtoListIterator {
    fn new(ctx: &mut Context, base: ProtoList, index: u64) -> ProtoListIterator {
        ProtoListIterator(ctx.alloc_cell(CellBody::ListIter(ListIterNode {
            base: base.0,
            index,
        })))
    }

    fn iter_node<'a>(self) -> &'a ListIterNode {
        unsafe {
            match &(*self.0).body {
                CellBody::ListIter(n) => n,
                _ => unreachable!("list iterator cell expected"),
            }
        }
    }

    pub fn as_value(self) -> Value {
        unsafe { cell_value(self.0) }
    }

    pub fn has_next(self) -> bool {
        let n = self.iter_node();
        n.index < count(n.base)
    }

    /// The current element without advancing.
    pub fn next(self) -> Value {
        let n = self.iter_node();
        ProtoList::from_cell(n.base).get_at(n.index as i64)
    }

    /// A new iterator at the next position.
    pub fn advance(self, ctx: &mut Context) -> ProtoListIterator {
        let n = self.iter_node();
        let base = ProtoList::from_cell(n.base);
        let index = n.index + 1;
        ProtoListIterator::new(ctx, base, index)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_context;

    fn ints(ctx: &mut Context, values: &[i64]) -> ProtoList {
        let mut list = ProtoList::new(ctx);
        for &v in values {
            list = list.append_last(ctx, Value::from_small_int(v));
        }
        list
    }

    fn to_ints(list: ProtoList) -> Vec<i64> {
        (0..list.get_size())
            .map(|i| list.get_at(i as i64).as_small_int())
            .collect()
    }

    #[test]
    fn test_empty_list() {
        with_context(|ctx| {
            let list = ProtoList::new(ctx);
            assert_eq!(list.get_size(), 0);
            assert!(list.get_first().is_none());
            assert!(list.get_last().is_none());
            assert!(list.get_at(0).is_none());
            assert!(!list.has(Value::from_small_int(1)));
        });
    }

    #[test]
    fn test_append_and_access() {
        with_context(|ctx| {
            let list = ints(ctx, &[10, 20, 30]);
            assert_eq!(list.get_size(), 3);
            assert_eq!(list.get_at(0).as_small_int(), 10);
            assert_eq!(list.get_at(1).as_small_int(), 20);
            assert_eq!(list.get_at(2).as_small_int(), 30);
            assert_eq!(list.get_at(-1).as_small_int(), 30);
            assert_eq!(list.get_at(-3).as_small_int(), 10);
            assert!(list.get_at(99).is_none());
            assert!(list.get_at(-4).is_none());
        });
    }

    #[test]
    fn test_immutability() {
        with_context(|ctx| {
            let list = ProtoList::new(ctx);
            let list1 = list.append_last(ctx, Value::from_small_int(10));
            let list2 = list1.append_last(ctx, Value::from_small_int(20));
            assert_eq!(list.get_size(), 0);
            assert_eq!(list1.get_size(), 1);
            assert_eq!(list2.get_size(), 2);
            assert_ne!(list1.0, list2.0);
        });
    }

    #[test]
    fn test_has_by_identity() {
        with_context(|ctx| {
            let list = ints(ctx, &[10, 20, 30]);
            assert!(list.has(Value::from_small_int(20)));
            assert!(!list.has(Value::from_small_int(99)));
        });
    }

    #[test]
    fn test_set_at() {
        with_context(|ctx| {
            let list = ints(ctx, &[10, 20, 30]);
            let updated = list.set_at(ctx, 1, Value::from_small_int(25));
            assert_eq!(to_ints(updated), vec![10, 25, 30]);
            assert_eq!(to_ints(list), vec![10, 20, 30]);

            // Out-of-range set returns the original container.
            let same = list.set_at(ctx, 99, Value::from_small_int(1));
            assert_eq!(same.0, list.0);
        });
    }

    #[test]
    fn test_insert_at() {
        with_context(|ctx| {
            let list = ints(ctx, &[10, 20, 30]);
            let front = list.insert_at(ctx, 0, Value::from_small_int(5));
            assert_eq!(to_ints(front), vec![5, 10, 20, 30]);
            let middle = list.insert_at(ctx, 1, Value::from_small_int(15));
            assert_eq!(to_ints(middle), vec![10, 15, 20, 30]);
            let end = list.insert_at(ctx, 3, Value::from_small_int(40));
            assert_eq!(to_ints(end), vec![10, 20, 30, 40]);
            // Past-the-end clamps to an append.
            let clamped = list.insert_at(ctx, 99, Value::from_small_int(40));
            assert_eq!(to_ints(clamped), vec![10, 20, 30, 40]);
        });
    }

    #[test]
    fn test_insert_then_remove_roundtrip() {
        with_context(|ctx| {
            let list = ints(ctx, &[1, 2, 3, 4, 5]);
            let inserted = list.insert_at(ctx, 2, Value::from_small_int(99));
            let removed = inserted.remove_at(ctx, 2);
            assert_eq!(to_ints(removed), to_ints(list));
        });
    }

    #[test]
    fn test_append_then_remove_last_roundtrip() {
        with_context(|ctx| {
            let list = ints(ctx, &[7, 8, 9]);
            let appended = list.append_last(ctx, Value::from_small_int(10));
            let removed = appended.remove_last(ctx);
            assert_eq!(to_ints(removed), to_ints(list));
        });
    }

    #[test]
    fn test_remove_at() {
        with_context(|ctx| {
            let list = ints(ctx, &[5, 10, 20, 25]);
            let removed = list.remove_at(ctx, 3);
            assert_eq!(to_ints(removed), vec![5, 10, 20]);
            // Out-of-range remove returns the original container.
            assert_eq!(list.remove_at(ctx, 9).0, list.0);
            // Removing from an empty list is a no-op.
            let e = ProtoList::new(ctx);
            assert_eq!(e.remove_at(ctx, 0).get_size(), 0);
        });
    }

    #[test]
    fn test_remove_first_and_last() {
        with_context(|ctx| {
            let list = ints(ctx, &[1, 2, 3]);
            assert_eq!(to_ints(list.remove_first(ctx)), vec![2, 3]);
            assert_eq!(to_ints(list.remove_last(ctx)), vec![1, 2]);
            let single = ints(ctx, &[9]);
            assert_eq!(single.remove_first(ctx).get_size(), 0);
        });
    }

    #[test]
    fn test_get_slice() {
        with_context(|ctx| {
            let list = ints(ctx, &[10, 20, 30]);
            let slice = list.get_slice(ctx, 1, 3);
            assert_eq!(to_ints(slice), vec![20, 30]);
            let all = list.get_slice(ctx, 0, 3);
            assert_eq!(to_ints(all), vec![10, 20, 30]);
            let empty = list.get_slice(ctx, 2, 1);
            assert_eq!(empty.get_size(), 0);
            let negative = list.get_slice(ctx, -2, 3);
            assert_eq!(to_ints(negative), vec![20, 30]);
        });
    }

    #[test]
    fn test_split_first_and_last() {
        with_context(|ctx| {
            let list = ints(ctx, &[1, 2, 3, 4, 5]);
            assert_eq!(to_ints(list.split_first(ctx, 2)), vec![1, 2]);
            assert_eq!(to_ints(list.split_last(ctx, 2)), vec![3, 4, 5]);
            assert_eq!(list.split_first(ctx, 0).get_size(), 0);
            assert_eq!(to_ints(list.split_first(ctx, 99)), vec![1, 2, 3, 4, 5]);
            assert_eq!(list.split_last(ctx, 99).get_size(), 0);
        });
    }

    #[test]
    fn test_remove_slice() {
        with_context(|ctx| {
            let list = ints(ctx, &[1, 2, 3, 4, 5]);
            let removed = list.remove_slice(ctx, 1, 3);
            assert_eq!(to_ints(removed), vec![1, 4, 5]);
            assert_eq!(list.remove_slice(ctx, 3, 1).0, list.0);
        });
    }

    #[test]
    fn test_extend() {
        with_context(|ctx| {
            let left = ints(ctx, &[1, 2, 3]);
            let right = ints(ctx, &[4, 5]);
            let joined = left.extend(ctx, right);
            assert_eq!(to_ints(joined), vec![1, 2, 3, 4, 5]);
            // Extending with empty keeps identity on the non-empty side.
            let e = ProtoList::new(ctx);
            assert_eq!(left.extend(ctx, e).0, left.0);
            assert_eq!(e.extend(ctx, right).0, right.0);
        });
    }

    #[test]
    fn test_iterator() {
        with_context(|ctx| {
            let list = ints(ctx, &[10, 20, 30]);
            let mut iter = list.get_iterator(ctx);
            let mut seen = Vec::new();
            while iter.has_next() {
                seen.push(iter.next().as_small_int());
                iter = iter.advance(ctx);
            }
            assert_eq!(seen, vec![10, 20, 30]);
            // An exhausted iterator yields none.
            assert!(iter.next().is_none());
        });
    }

    #[test]
    fn test_avl_invariant_under_churn() {
        with_context(|ctx| {
            let mut list = ProtoList::new(ctx);
            for i in 0..500i64 {
                list = list.append_last(ctx, Value::from_small_int(i));
                assert_eq!(list.avl_violation(), 0, "append {i} broke balance");
            }
            for i in (0..500i64).step_by(7) {
                list = list.remove_at(ctx, i % list.get_size() as i64);
                assert_eq!(list.avl_violation(), 0);
            }
            let front = list.split_first(ctx, 100);
            assert_eq!(front.avl_violation(), 0);
            let back = list.split_last(ctx, 100);
            assert_eq!(back.avl_violation(), 0);
            let joined = front.extend(ctx, back);
            assert_eq!(joined.avl_violation(), 0);
        });
    }

    #[test]
    fn test_large_positional_access() {
        with_context(|ctx| {
            let mut list = ProtoList::new(ctx);
            for i in 0..10_000i64 {
                list = list.append_last(ctx, Value::from_small_int(i));
            }
            assert_eq!(list.get_size(), 10_000);
            for i in [0i64, 1, 777, 5_000, 9_999] {
                assert_eq!(list.get_at(i).as_small_int(), i);
            }
            // In-order iteration sums to the closed form.
            let mut sum = 0i64;
            let mut iter = list.get_iterator(ctx);
            while iter.has_next() {
                sum += iter.next().as_small_int();
                iter = iter.advance(ctx);
            }
            assert_eq!(sum, 9_999 * 10_000 / 2);
        });
    }
}
