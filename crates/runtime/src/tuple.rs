//! Interned Tuples
//!
//! A tuple is an immutable sequence: small tuples store up to `TUPLE_SIZE`
//! value words inline in one leaf cell, larger tuples form a minimum-height
//! tree of interior cells with up to `TUPLE_SIZE` children each.
//!
//! Every tuple is canonicalized through the process-wide tuple dictionary, a
//! persistent BST keyed on lexicographic element comparison and published by
//! CAS on the Space's interning root: two content-equal tuples are the same
//! cell, so tuple equality and hashing collapse to identity.

use crate::cell::{
    Cell, CellBody, TUPLE_SIZE, TupleDictNode, TupleIterNode, TupleNode, cell_value,
    pack_count_height, unpack_count, unpack_height,
};
use crate::context::Context;
use crate::list::ProtoList;
use crate::space::Space;
use proto_core::{PointerTag, Value};
use std::cmp::Ordering;
use std::ptr;
use std::sync::atomic::Ordering as MemoryOrdering;

// =============================================================================
// Tuple tree
// =============================================================================

#[inline(always)]
fn node<'a>(cell: *mut Cell) -> &'a TupleNode {
    unsafe {
        match &(*cell).body {
            CellBody::Tuple(n) => n,
            _ => unreachable!("tuple cell expected"),
        }
    }
}

#[inline(always)]
fn tuple_count(cell: *mut Cell) -> u64 {
    unpack_count(node(cell).count_height)
}

fn leaf(ctx: &mut Context, values: &[Value]) -> *mut Cell {
    debug_assert!(values.len() <= TUPLE_SIZE);
    let mut slots = [0u64; TUPLE_SIZE];
    for (slot, v) in slots.iter_mut().zip(values) {
        *slot = v.raw();
    }
    ctx.alloc_cell(CellBody::Tuple(TupleNode {
        count_height: pack_count_height(values.len() as u64, 0),
        slots,
    }))
}

fn interior(ctx: &mut Context, children: &[*mut Cell], height: u8) -> *mut Cell {
    debug_assert!(children.len() <= TUPLE_SIZE);
    let mut slots = [0u64; TUPLE_SIZE];
    let mut total = 0u64;
    for (slot, &child) in slots.iter_mut().zip(children) {
        *slot = child as u64;
        total += tuple_count(child);
    }
    ctx.alloc_cell(CellBody::Tuple(TupleNode {
        count_height: pack_count_height(total, height),
        slots,
    }))
}

/// Build the minimum-height tuple tree over `values`.
fn build(ctx: &mut Context, values: &[Value]) -> *mut Cell {
    if values.is_empty() {
        return leaf(ctx, &[]);
    }
    let mut level: Vec<*mut Cell> = values
        .chunks(TUPLE_SIZE)
        .map(|chunk| leaf(ctx, chunk))
        .collect();
    let mut height = 0u8;
    while level.len() > 1 {
        height += 1;
        level = level
            .chunks(TUPLE_SIZE)
            .map(|chunk| interior(ctx, chunk, height))
            .collect();
    }
    level[0]
}

fn element_at(tree: *mut Cell, mut index: u64) -> Value {
    let mut current = tree;
    loop {
        let n = node(current);
        if unpack_height(n.count_height) == 0 {
            return unsafe { Value::from_raw(n.slots[index as usize]) };
        }
        for slot in n.slots {
            let child = slot as *mut Cell;
            if child.is_null() {
                break;
            }
            let child_count = tuple_count(child);
            if index < child_count {
                current = child;
                break;
            }
            index -= child_count;
        }
    }
}

/// Lexicographic content comparison: element words first, then length.
fn compare_contents(a: *mut Cell, b: *mut Cell) -> Ordering {
    let count_a = tuple_count(a);
    let count_b = tuple_count(b);
    let common = count_a.min(count_b);
    for i in 0..common {
        let ord = element_at(a, i).raw().cmp(&element_at(b, i).raw());
        if ord != Ordering::Equal {
            return ord;
        }
    }
    count_a.cmp(&count_b)
}

// =============================================================================
// Tuple dictionary
// =============================================================================

#[inline(always)]
fn dict_node<'a>(cell: *mut Cell) -> &'a TupleDictNode {
    unsafe {
        match &(*cell).body {
            CellBody::TupleDict(n) => n,
            _ => unreachable!("tuple dictionary cell expected"),
        }
    }
}

#[inline(always)]
fn dict_height(cell: *mut Cell) -> u8 {
    if cell.is_null() {
        0
    } else {
        unpack_height(dict_node(cell).count_height)
    }
}

#[inline(always)]
fn dict_count(cell: *mut Cell) -> u64 {
    if cell.is_null() {
        0
    } else {
        unpack_count(dict_node(cell).count_height)
    }
}

fn dict_new_node(
    ctx: &mut Context,
    key: *mut Cell,
    previous: *mut Cell,
    next: *mut Cell,
) -> *mut Cell {
    let n = 1 + dict_count(previous) + dict_count(next);
    let h = 1 + dict_height(previous).max(dict_height(next));
    ctx.alloc_cell(CellBody::TupleDict(TupleDictNode {
        key,
        previous,
        next,
        count_height: pack_count_height(n, h),
    }))
}

#[inline(always)]
fn dict_balance(cell: *mut Cell) -> i32 {
    if cell.is_null() {
        0
    } else {
        dict_height(dict_node(cell).next) as i32 - dict_height(dict_node(cell).previous) as i32
    }
}

fn dict_rotate_right(ctx: &mut Context, y: *mut Cell) -> *mut Cell {
    let yn = dict_node(y);
    let xn = dict_node(yn.previous);
    let new_y = dict_new_node(ctx, yn.key, xn.next, yn.next);
    dict_new_node(ctx, xn.key, xn.previous, new_y)
}

fn dict_rotate_left(ctx: &mut Context, x: *mut Cell) -> *mut Cell {
    let xn = dict_node(x);
    let yn = dict_node(xn.next);
    let new_x = dict_new_node(ctx, xn.key, xn.previous, yn.previous);
    dict_new_node(ctx, yn.key, new_x, yn.next)
}

fn dict_rebalance(ctx: &mut Context, cell: *mut Cell) -> *mut Cell {
    let b = dict_balance(cell);
    if b < -1 {
        if dict_balance(dict_node(cell).previous) <= 0 {
            dict_rotate_right(ctx, cell)
        } else {
            let n = dict_node(cell);
            let new_prev = dict_rotate_left(ctx, n.previous);
            let replaced = dict_new_node(ctx, n.key, new_prev, n.next);
            dict_rotate_right(ctx, replaced)
        }
    } else if b > 1 {
        if dict_balance(dict_node(cell).next) >= 0 {
            dict_rotate_left(ctx, cell)
        } else {
            let n = dict_node(cell);
            let new_next = dict_rotate_right(ctx, n.next);
            let replaced = dict_new_node(ctx, n.key, n.previous, new_next);
            dict_rotate_left(ctx, replaced)
        }
    } else {
        cell
    }
}

/// The canonical cell for `tuple`'s contents, if one is registered.
fn dict_get(root: *mut Cell, tuple: *mut Cell) -> Option<*mut Cell> {
    let mut current = root;
    while !current.is_null() {
        let n = dict_node(current);
        match compare_contents(tuple, n.key) {
            Ordering::Equal => return Some(n.key),
            Ordering::Less => current = n.previous,
            Ordering::Greater => current = n.next,
        }
    }
    None
}

/// A new dictionary root with `tuple` registered; path-copying.
fn dict_set(ctx: &mut Context, root: *mut Cell, tuple: *mut Cell) -> *mut Cell {
    if root.is_null() {
        return dict_new_node(ctx, tuple, ptr::null_mut(), ptr::null_mut());
    }
    let n = dict_node(root);
    let replaced = match compare_contents(tuple, n.key) {
        Ordering::Equal => return root,
        Ordering::Less => {
            let new_prev = dict_set(ctx, n.previous, tuple);
            dict_new_node(ctx, n.key, new_prev, n.next)
        }
        Ordering::Greater => {
            let new_next = dict_set(ctx, n.next, tuple);
            dict_new_node(ctx, n.key, n.previous, new_next)
        }
    };
    dict_rebalance(ctx, replaced)
}

/// Canonicalize `candidate` through the Space-wide dictionary.
///
/// Returns the registered cell for equal contents; otherwise publishes
/// `candidate` by CAS on the interning root and returns it.
fn intern(ctx: &mut Context, candidate: *mut Cell) -> *mut Cell {
    let space: *const Space = ctx.space();
    loop {
        let root = unsafe { (*space).tuple_root.load(MemoryOrdering::Acquire) };
        if let Some(existing) = dict_get(root, candidate) {
            return existing;
        }
        let new_root = dict_set(ctx, root, candidate);
        let published = unsafe {
            (*space).tuple_root.compare_exchange(
                root,
                new_root,
                MemoryOrdering::AcqRel,
                MemoryOrdering::Acquire,
            )
        };
        if published.is_ok() {
            return candidate;
        }
    }
}

// =============================================================================
// ProtoTuple
// =============================================================================

/// Handle to a canonical (interned) tuple cell. Content equality implies
/// handle equality.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProtoTuple(pub(crate) *mut Cell);

impl ProtoTuple {
    /// The canonical tuple over the elements of `list`.
    pub fn from_list(ctx: &mut Context, list: ProtoList) -> ProtoTuple {
        let size = list.get_size();
        let mut values = Vec::with_capacity(size as usize);
        for i in 0..size {
            values.push(list.get_at(i as i64));
        }
        ProtoTuple::from_values(ctx, &values)
    }

    /// The canonical tuple over `values`.
    pub(crate) fn from_values(ctx: &mut Context, values: &[Value]) -> ProtoTuple {
        let candidate = build(ctx, values);
        ProtoTuple(intern(ctx, candidate))
    }

    pub(crate) fn from_cell(cell: *mut Cell) -> ProtoTuple {
        debug_assert!(matches!(unsafe { &(*cell).body }, CellBody::Tuple(_)));
        ProtoTuple(cell)
    }

    pub(crate) fn cell(self) -> *mut Cell {
        self.0
    }

    /// The tuple as a tagged value word.
    pub fn as_value(self) -> Value {
        unsafe { cell_value(self.0) }
    }

    /// Recover a tuple handle from a value word; `None` for any other tag.
    pub fn from_value(v: Value) -> Option<ProtoTuple> {
        if v.tag() == PointerTag::Tuple as u8 && !v.is_none() {
            Some(ProtoTuple(v.cell_address() as *mut Cell))
        } else {
            None
        }
    }

    pub fn get_size(self) -> u64 {
        tuple_count(self.0)
    }

    /// Identity hash; canonicalization makes it a content hash as well.
    pub fn get_hash(self) -> u64 {
        unsafe { (*self.0).hash() }
    }

    /// The value at `index` (negative indexes relative to the size); none
    /// when out of range.
    pub fn get_at(self, index: i64) -> Value {
        let size = self.get_size();
        let resolved = if index < 0 { index + size as i64 } else { index };
        if resolved < 0 || resolved as u64 >= size {
            return Value::NONE;
        }
        element_at(self.0, resolved as u64)
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
        (0..size).any(|i| element_at(self.0, i) == value)
    }

    /// The elements as a vector of value words.
    pub(crate) fn elements(self) -> Vec<Value> {
        let size = self.get_size();
        (0..size).map(|i| element_at(self.0, i)).collect()
    }

    /// The elements as a fresh persistent list.
    pub fn as_list(self, ctx: &mut Context) -> ProtoList {
        let mut list = ProtoList::new(ctx);
        for v in self.elements() {
            list = list.append_last(ctx, v);
        }
        list
    }

    /// A canonical tuple with position `index` replaced; out-of-range
    /// indexes return the tuple unchanged.
    pub fn set_at(self, ctx: &mut Context, index: i64, value: Value) -> ProtoTuple {
        let size = self.get_size();
        let resolved = if index < 0 { index + size as i64 } else { index };
        if resolved < 0 || resolved as u64 >= size {
            return self;
        }
        let mut values = self.elements();
        values[resolved as usize] = value;
        ProtoTuple::from_values(ctx, &values)
    }

    /// A canonical tuple with `value` inserted at `index`; positions past
    /// the end append.
    pub fn insert_at(self, ctx: &mut Context, index: i64, value: Value) -> ProtoTuple {
        let size = self.get_size();
        let resolved = (if index < 0 { index + size as i64 } else { index })
            .clamp(0, size as i64) as usize;
        let mut values = self.elements();
        values.insert(resolved, value);
        ProtoTuple::from_values(ctx, &values)
    }

    /// Concatenation with `other` in front.
    pub fn append_first(self, ctx: &mut Context, other: ProtoTuple) -> ProtoTuple {
        let mut values = other.elements();
        values.extend(self.elements());
        ProtoTuple::from_values(ctx, &values)
    }

    /// Concatenation with `other` behind.
    pub fn append_last(self, ctx: &mut Context, other: ProtoTuple) -> ProtoTuple {
        let mut values = self.elements();
        values.extend(other.elements());
        ProtoTuple::from_values(ctx, &values)
    }

    /// The first `keep` elements.
    pub fn split_first(self, ctx: &mut Context, keep: i64) -> ProtoTuple {
        let size = self.get_size() as i64;
        let keep = keep.clamp(0, size) as usize;
        let values = self.elements();
        ProtoTuple::from_values(ctx, &values[..keep])
    }

    /// Everything from position `skip` on.
    pub fn split_last(self, ctx: &mut Context, skip: i64) -> ProtoTuple {
        let size = self.get_size() as i64;
        let skip = skip.clamp(0, size) as usize;
        let values = self.elements();
        ProtoTuple::from_values(ctx, &values[skip..])
    }

    /// Without the first `count` elements.
    pub fn remove_first(self, ctx: &mut Context, count: i64) -> ProtoTuple {
        self.split_last(ctx, count)
    }

    /// Without the last `count` elements.
    pub fn remove_last(self, ctx: &mut Context, count: i64) -> ProtoTuple {
        let size = self.get_size() as i64;
        self.split_first(ctx, size - count.clamp(0, size))
    }

    /// Without position `index`; out-of-range indexes return the tuple
    /// unchanged.
    pub fn remove_at(self, ctx: &mut Context, index: i64) -> ProtoTuple {
        let size = self.get_size();
        let resolved = if index < 0 { index + size as i64 } else { index };
        if resolved < 0 || resolved as u64 >= size {
            return self;
        }
        let mut values = self.elements();
        values.remove(resolved as usize);
        ProtoTuple::from_values(ctx, &values)
    }

    /// The elements in `[from, to)`.
    pub fn get_slice(self, ctx: &mut Context, from: i64, to: i64) -> ProtoTuple {
        let size = self.get_size() as i64;
        let from = (if from < 0 { from + size } else { from }).clamp(0, size) as usize;
        let to = (if to < 0 { to + size } else { to }).clamp(0, size) as usize;
        if to <= from {
            return ProtoTuple::from_values(ctx, &[]);
        }
        let values = self.elements();
        ProtoTuple::from_values(ctx, &values[from..to])
    }

    /// Without the elements in `[from, to)`.
    pub fn remove_slice(self, ctx: &mut Context, from: i64, to: i64) -> ProtoTuple {
        let size = self.get_size() as i64;
        let from = (if from < 0 { from + size } else { from }).clamp(0, size) as usize;
        let to = (if to < 0 { to + size } else { to }).clamp(0, size) as usize;
        if to <= from {
            return self;
        }
        let mut values = self.elements();
        values.drain(from..to);
        ProtoTuple::from_values(ctx, &values)
    }

    /// An iterator cell positioned at the first element.
    pub fn get_iterator(self, ctx: &mut Context) -> ProtoTupleIterator {
        ProtoTupleIterator::new(ctx, self, 0)
    }
}

// =============================================================================
// Iterator
// =============================================================================

/// Positional iterator cell over a tuple. `next` does not advance; `advance`
/// returns a new iterator at the following position.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct ProtoTupleIterator(pub(crate) *mut Cell);

impl ProtoTupleIterator {
    fn new(ctx: &mut Context, base: ProtoTuple, index: u64) -> ProtoTupleIterator {
        ProtoTupleIterator(ctx.alloc_cell(CellBody::TupleIter(TupleIterNode {
            base: base.0,
            index,
        })))
    }

    fn iter_node<'a>(self) -> &'a TupleIterNode {
        unsafe {
            match &(*self.0).body {
                CellBody::TupleIter(n) => n,
                _ => unreachable!("tuple iterator cell expected"),
            }
        }
    }

    pub fn as_value(self) -> Value {
        unsafe { cell_value(self.0) }
    }

    pub fn has_next(self) -> bool {
        let n = self.iter_node();
        n.index < tuple_count(n.base)
    }

    pub fn next(self) -> Value {
        let n = self.iter_node();
        ProtoTuple::from_cell(n.base).get_at(n.index as i64)
    }

    pub fn advance(self, ctx: &mut Context) -> ProtoTupleIterator {
        let n = self.iter_node();
        let base = ProtoTuple::from_cell(n.base);
        let index = n.index + 1;
        ProtoTupleIterator::new(ctx, base, index)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_context;

    fn int_tuple(ctx: &mut Context, values: &[i64]) -> ProtoTuple {
        let words: Vec<Value> = values.iter().map(|&v| Value::from_small_int(v)).collect();
        ProtoTuple::from_values(ctx, &words)
    }

    #[test]
    fn test_empty_tuple_is_canonical() {
        with_context(|ctx| {
            let a = ctx.new_tuple();
            let b = ctx.new_tuple();
            assert_eq!(a.get_size(), 0);
            assert_eq!(a.0, b.0);
        });
    }

    #[test]
    fn test_interning_equal_contents() {
        with_context(|ctx| {
            let mut list1 = ctx.new_list();
            list1 = list1.append_last(ctx, Value::from_small_int(1));
            list1 = list1.append_last(ctx, Value::from_small_int(2));
            let mut list2 = ctx.new_list();
            list2 = list2.append_last(ctx, Value::from_small_int(1));
            list2 = list2.append_last(ctx, Value::from_small_int(2));

            let t1 = ctx.new_tuple_from_list(list1);
            let t2 = ctx.new_tuple_from_list(list2);
            assert_eq!(t1.0, t2.0, "equal contents must intern to one cell");

            let mut list3 = ctx.new_list();
            list3 = list3.append_last(ctx, Value::from_small_int(1));
            list3 = list3.append_last(ctx, Value::from_small_int(3));
            let t3 = ctx.new_tuple_from_list(list3);
            assert_ne!(t1.0, t3.0);
        });
    }

    #[test]
    fn test_interning_across_sizes() {
        with_context(|ctx| {
            // Tuples that straddle the leaf/interior boundary still intern.
            let big_a = int_tuple(ctx, &(0..23).collect::<Vec<i64>>());
            let big_b = int_tuple(ctx, &(0..23).collect::<Vec<i64>>());
            assert_eq!(big_a.0, big_b.0);
            assert_eq!(big_a.get_hash(), big_b.get_hash());
        });
    }

    #[test]
    fn test_get_at() {
        with_context(|ctx| {
            let t = int_tuple(ctx, &[10, 20, 30]);
            assert_eq!(t.get_size(), 3);
            assert_eq!(t.get_at(0).as_small_int(), 10);
            assert_eq!(t.get_at(2).as_small_int(), 30);
            assert_eq!(t.get_at(-1).as_small_int(), 30);
            assert!(t.get_at(3).is_none());
            assert_eq!(t.get_first().as_small_int(), 10);
            assert_eq!(t.get_last().as_small_int(), 30);
        });
    }

    #[test]
    fn test_deep_tree_access() {
        with_context(|ctx| {
            // 5^3 + 1 elements forces three levels of interior nodes.
            let values: Vec<i64> = (0..126).collect();
            let t = int_tuple(ctx, &values);
            assert_eq!(t.get_size(), 126);
            for i in [0i64, 4, 5, 24, 25, 124, 125] {
                assert_eq!(t.get_at(i).as_small_int(), i);
            }
        });
    }

    #[test]
    fn test_roundtrip_through_list() {
        with_context(|ctx| {
            let mut list = ctx.new_list();
            for i in 0..12 {
                list = list.append_last(ctx, Value::from_small_int(i));
            }
            let tuple = ctx.new_tuple_from_list(list);
            let back = tuple.as_list(ctx);
            assert_eq!(back.get_size(), list.get_size());
            for i in 0..12 {
                assert_eq!(back.get_at(i).as_small_int(), list.get_at(i).as_small_int());
            }
        });
    }

    #[test]
    fn test_mutating_ops_recanonicalize() {
        with_context(|ctx| {
            let t = int_tuple(ctx, &[1, 2, 3]);
            let set = t.set_at(ctx, 1, Value::from_small_int(9));
            assert_eq!(set.get_at(1).as_small_int(), 9);
            assert_eq!(set.0, int_tuple(ctx, &[1, 9, 3]).0);

            let inserted = t.insert_at(ctx, 0, Value::from_small_int(0));
            assert_eq!(inserted.0, int_tuple(ctx, &[0, 1, 2, 3]).0);

            let removed = t.remove_at(ctx, 1);
            assert_eq!(removed.0, int_tuple(ctx, &[1, 3]).0);

            // Out of range: unchanged handle.
            assert_eq!(t.set_at(ctx, 7, Value::from_small_int(1)).0, t.0);
            assert_eq!(t.remove_at(ctx, -9).0, t.0);
        });
    }

    #[test]
    fn test_appends_and_splits() {
        with_context(|ctx| {
            let a = int_tuple(ctx, &[1, 2]);
            let b = int_tuple(ctx, &[3, 4, 5]);
            assert_eq!(a.append_last(ctx, b).0, int_tuple(ctx, &[1, 2, 3, 4, 5]).0);
            assert_eq!(a.append_first(ctx, b).0, int_tuple(ctx, &[3, 4, 5, 1, 2]).0);

            let joined = a.append_last(ctx, b);
            assert_eq!(joined.split_first(ctx, 2).0, a.0);
            assert_eq!(joined.split_last(ctx, 2).0, b.0);
            assert_eq!(joined.remove_first(ctx, 2).0, b.0);
            assert_eq!(joined.remove_last(ctx, 3).0, a.0);
            assert_eq!(joined.get_slice(ctx, 1, 3).0, int_tuple(ctx, &[2, 3]).0);
            assert_eq!(
                joined.remove_slice(ctx, 1, 4).0,
                int_tuple(ctx, &[1, 5]).0
            );
        });
    }

    #[test]
    fn test_has() {
        with_context(|ctx| {
            let t = int_tuple(ctx, &[1, 2, 3]);
            assert!(t.has(Value::from_small_int(2)));
            assert!(!t.has(Value::from_small_int(9)));
        });
    }

    #[test]
    fn test_iterator() {
        with_context(|ctx| {
            let t = int_tuple(ctx, &[7, 8, 9]);
            let mut iter = t.get_iterator(ctx);
            let mut seen = Vec::new();
            while iter.has_next() {
                seen.push(iter.next().as_small_int());
                iter = iter.advance(ctx);
            }
            assert_eq!(seen, vec![7, 8, 9]);
        });
    }
}
