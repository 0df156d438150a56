//! Heap Cells
//!
//! Every heap entity of the runtime is a 64-byte, 64-byte-aligned `Cell`:
//! a `next_cell` link shared by the per-frame allocation chain and the free
//! list, and a tagged `CellBody` payload. Subtype variation is a sum type
//! with a per-variant reference-traversal function; `for_each_reference` is
//! the single polymorphic operation the collector needs.
//!
//! Cells are immutable after construction with three exceptions: the
//! `next_cell` link (allocation chaining and free-list threading), thread
//! cells (whose lifecycle fields the owning thread updates), and byte buffer
//! payloads (which live outside the cell heap).
//!
//! Zeroed memory is a valid cell: discriminant 0 is `Free`, which is exactly
//! what the sweep leaves behind and what fresh OS blocks contain.

use crate::context::Context;
use crate::method::ProtoMethod;
use proto_core::{PointerTag, Value};
use std::sync::atomic::AtomicU32;

/// Cells in the method cache of one thread. Must be a power of two.
pub const THREAD_CACHE_DEPTH: usize = 1024;

/// Mask extracting the element count from a packed count/height word.
pub(crate) const COUNT_MASK: u64 = (1u64 << 56) - 1;

/// Pack an element count and a tree height into one word.
#[inline(always)]
pub(crate) fn pack_count_height(count: u64, height: u8) -> u64 {
    debug_assert!(count <= COUNT_MASK);
    count | ((height as u64) << 56)
}

#[inline(always)]
pub(crate) fn unpack_count(word: u64) -> u64 {
    word & COUNT_MASK
}

#[inline(always)]
pub(crate) fn unpack_height(word: u64) -> u8 {
    (word >> 56) as u8
}

// =============================================================================
// Per-variant payloads
// =============================================================================

/// One node of a persistent ordered list: an AVL tree node carrying the
/// value, both subtrees, the XOR-combined content hash and packed
/// count/height.
#[repr(C)]
pub struct ListNode {
    pub value: Value,
    pub previous: *mut Cell,
    pub next: *mut Cell,
    pub hash: u64,
    pub count_height: u64,
}

/// Positional iterator over a list.
#[repr(C)]
pub struct ListIterNode {
    pub base: *mut Cell,
    pub index: u64,
}

/// One node of a persistent sparse map keyed by a 64-bit index.
#[repr(C)]
pub struct SparseNode {
    pub key: u64,
    pub value: Value,
    pub previous: *mut Cell,
    pub next: *mut Cell,
    pub hash: u64,
    pub count_height: u64,
}

/// Zipper iterator over a sparse map: the current node plus the pending
/// ancestor stack, encoded as a linked list of iterator cells.
#[repr(C)]
pub struct SparseIterNode {
    pub current: *mut Cell,
    pub queue: *mut Cell,
}

/// Maximum fan-out of a tuple node.
pub const TUPLE_SIZE: usize = 5;

/// One node of an interned tuple. Height 0 nodes store up to `TUPLE_SIZE`
/// value words inline; taller nodes store up to `TUPLE_SIZE` child tuple
/// cells. `count` is always the total element count of the subtree.
#[repr(C)]
pub struct TupleNode {
    pub count_height: u64,
    pub slots: [u64; TUPLE_SIZE],
}

/// Positional iterator over a tuple.
#[repr(C)]
pub struct TupleIterNode {
    pub base: *mut Cell,
    pub index: u64,
}

/// A string: a view over a tuple of embedded `UnicodeChar` values.
#[repr(C)]
pub struct StringNode {
    pub base_tuple: *mut Cell,
}

/// Positional iterator over a string.
#[repr(C)]
pub struct StringIterNode {
    pub base: *mut Cell,
    pub index: u64,
}

/// One node of the process-wide tuple interning dictionary: a BST keyed on
/// lexicographic tuple content comparison.
#[repr(C)]
pub struct TupleDictNode {
    pub key: *mut Cell,
    pub previous: *mut Cell,
    pub next: *mut Cell,
    pub count_height: u64,
}

/// A prototype object: the head of its parent chain, its mutable-reference
/// id (0 means immutable identity) and its own-attribute sparse map.
#[repr(C)]
pub struct ObjectNode {
    pub parent: *mut Cell,
    pub mutable_ref: u64,
    pub attributes: *mut Cell,
}

/// One link of a multi-parent chain, traversed head-first for attribute
/// lookup.
#[repr(C)]
pub struct ParentLinkNode {
    pub tail: *mut Cell,
    pub object: *mut Cell,
}

/// A native method wrapped as a first-class value.
#[repr(C)]
pub struct MethodNode {
    pub method: ProtoMethod,
}

/// A byte buffer. The data lives outside the cell heap; when `owned` the
/// sweep finalizer frees it.
#[repr(C)]
pub struct BufferNode {
    pub size: u64,
    pub data: *mut u8,
    pub owned: bool,
}

/// An opaque pointer the collector never follows.
#[repr(C)]
pub struct ExternalNode {
    pub pointer: *mut libc::c_void,
}

/// One entry of the per-thread direct-mapped method cache.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MethodCacheEntry {
    pub object: Value,
    pub method_name: Value,
    pub method: Option<ProtoMethod>,
}

impl MethodCacheEntry {
    pub const EMPTY: MethodCacheEntry = MethodCacheEntry {
        object: Value::NONE,
        method_name: Value::NONE,
        method: None,
    };
}

/// An application thread. Lifecycle fields are written by the owning thread;
/// the collector reads them only while the world is stopped, except `state`,
/// which carries the safepoint handshake.
#[repr(C)]
pub struct ThreadNode {
    pub name: Value,
    pub current_context: *mut Context,
    pub free_cells: *mut Cell,
    pub state: AtomicU32,
    pub unmanaged_count: u32,
    pub method_cache: *mut MethodCacheEntry,
    pub os_thread: *mut std::thread::JoinHandle<()>,
}

// =============================================================================
// Cell
// =============================================================================

/// The payload of a cell. Discriminant 0 (`Free`) is the state of zeroed
/// memory: fresh OS blocks and swept cells.
#[repr(C, u8)]
pub enum CellBody {
    Free,
    List(ListNode),
    ListIter(ListIterNode),
    SparseMap(SparseNode),
    SparseMapIter(SparseIterNode),
    Tuple(TupleNode),
    TupleIter(TupleIterNode),
    Str(StringNode),
    StrIter(StringIterNode),
    Object(ObjectNode),
    ParentLink(ParentLinkNode),
    TupleDict(TupleDictNode),
    Method(MethodNode),
    ByteBuffer(BufferNode),
    ExternalPointer(ExternalNode),
    Thread(ThreadNode),
}

/// A 64-byte heap cell.
#[repr(C, align(64))]
pub struct Cell {
    /// Allocation-chain / free-list link. The only mutable header field.
    pub next_cell: *mut Cell,
    pub body: CellBody,
}

impl Cell {
    /// The cell address, which doubles as its identity.
    #[inline(always)]
    pub fn address(&self) -> u64 {
        self as *const Cell as u64
    }

    /// Identity hash: the top 60 bits of the address.
    #[inline(always)]
    pub fn hash(&self) -> u64 {
        self.address() >> 4
    }
}

/// The pointer tag a cell carries when handled as a value word.
///
/// Parent links and interning-dictionary nodes are internal cells; when they
/// do surface as values they present as plain objects.
pub(crate) fn body_tag(body: &CellBody) -> PointerTag {
    match body {
        CellBody::List(_) => PointerTag::List,
        CellBody::ListIter(_) => PointerTag::ListIterator,
        CellBody::SparseMap(_) => PointerTag::SparseMap,
        CellBody::SparseMapIter(_) => PointerTag::SparseMapIterator,
        CellBody::Tuple(_) => PointerTag::Tuple,
        CellBody::TupleIter(_) => PointerTag::TupleIterator,
        CellBody::Str(_) => PointerTag::String,
        CellBody::StrIter(_) => PointerTag::StringIterator,
        CellBody::Method(_) => PointerTag::Method,
        CellBody::ByteBuffer(_) => PointerTag::ByteBuffer,
        CellBody::ExternalPointer(_) => PointerTag::ExternalPointer,
        CellBody::Thread(_) => PointerTag::Thread,
        CellBody::Object(_)
        | CellBody::ParentLink(_)
        | CellBody::TupleDict(_)
        | CellBody::Free => PointerTag::Object,
    }
}

/// Wrap a cell pointer into a tagged value word.
///
/// # Safety
/// `cell` must point to a constructed cell.
#[inline]
pub(crate) unsafe fn cell_value(cell: *mut Cell) -> Value {
    debug_assert!(!cell.is_null());
    let tag = unsafe { body_tag(&(*cell).body) };
    Value::from_cell_address(tag, cell as u64)
}

/// The cell a value word references, or null for embedded scalars and none.
#[inline(always)]
pub(crate) fn value_cell(v: Value) -> *mut Cell {
    if v.is_cell() {
        v.cell_address() as *mut Cell
    } else {
        std::ptr::null_mut()
    }
}

// =============================================================================
// Reference traversal and finalization
// =============================================================================

/// Invoke `visit` on every cell this cell references.
///
/// This is the reference-polymorphic hook the collector drives: each subtype
/// declares exactly which of its fields are cell references.
///
/// # Safety
/// `cell` must point to a constructed cell; for thread cells the world must
/// be stopped (or the thread otherwise quiescent) so the context chain and
/// free pool are stable.
pub(crate) unsafe fn for_each_reference(cell: *mut Cell, visit: &mut dyn FnMut(*mut Cell)) {
    fn visit_value(visit: &mut dyn FnMut(*mut Cell), v: Value) {
        let c = value_cell(v);
        if !c.is_null() {
            visit(c);
        }
    }

    match unsafe { &(*cell).body } {
        CellBody::Free | CellBody::Method(_) | CellBody::ByteBuffer(_)
        | CellBody::ExternalPointer(_) => {}
        CellBody::List(n) => {
            if !n.previous.is_null() {
                visit(n.previous);
            }
            if !n.next.is_null() {
                visit(n.next);
            }
            visit_value(visit, n.value);
        }
        CellBody::ListIter(n) => {
            if !n.base.is_null() {
                visit(n.base);
            }
        }
        CellBody::SparseMap(n) => {
            if !n.previous.is_null() {
                visit(n.previous);
            }
            if !n.next.is_null() {
                visit(n.next);
            }
            visit_value(visit, n.value);
        }
        CellBody::SparseMapIter(n) => {
            if !n.current.is_null() {
                visit(n.current);
            }
            if !n.queue.is_null() {
                visit(n.queue);
            }
        }
        CellBody::Tuple(n) => {
            let count = unpack_count(n.count_height);
            if unpack_height(n.count_height) == 0 {
                for i in 0..(count as usize).min(TUPLE_SIZE) {
                    visit_value(visit, unsafe { Value::from_raw(n.slots[i]) });
                }
            } else {
                for slot in n.slots {
                    let child = slot as *mut Cell;
                    if !child.is_null() {
                        visit(child);
                    }
                }
            }
        }
        CellBody::TupleIter(n) => {
            if !n.base.is_null() {
                visit(n.base);
            }
        }
        CellBody::Str(n) => {
            if !n.base_tuple.is_null() {
                visit(n.base_tuple);
            }
        }
        CellBody::StrIter(n) => {
            if !n.base.is_null() {
                visit(n.base);
            }
        }
        CellBody::Object(n) => {
            if !n.parent.is_null() {
                visit(n.parent);
            }
            if !n.attributes.is_null() {
                visit(n.attributes);
            }
        }
        CellBody::ParentLink(n) => {
            if !n.tail.is_null() {
                visit(n.tail);
            }
            if !n.object.is_null() {
                visit(n.object);
            }
        }
        CellBody::TupleDict(n) => {
            if !n.previous.is_null() {
                visit(n.previous);
            }
            if !n.next.is_null() {
                visit(n.next);
            }
            if !n.key.is_null() {
                visit(n.key);
            }
        }
        CellBody::Thread(n) => {
            visit_value(visit, n.name);

            // Method cache entries keep resolved receivers alive: once an
            // object leaves every scope, the cache may hold the only
            // remaining reference.
            if !n.method_cache.is_null() {
                for i in 0..THREAD_CACHE_DEPTH {
                    let entry = unsafe { *n.method_cache.add(i) };
                    visit_value(visit, entry.object);
                    visit_value(visit, entry.method_name);
                }
            }

            // The context chain: every frame's allocation chain and every
            // registered locals slot.
            let mut ctx = n.current_context;
            while !ctx.is_null() {
                unsafe {
                    let mut chained = (*ctx).last_allocated_cell;
                    while !chained.is_null() {
                        visit(chained);
                        chained = (*chained).next_cell;
                    }
                    let locals = (*ctx).locals_base;
                    if !locals.is_null() {
                        for i in 0..(*ctx).locals_count as usize {
                            visit_value(visit, *locals.add(i));
                        }
                    }
                    ctx = (*ctx).previous;
                }
            }

            // The thread-local free pool. Retaining unreferenced pool cells
            // is safe: they have been reset to zero.
            let mut free = n.free_cells;
            while !free.is_null() {
                visit(free);
                free = unsafe { (*free).next_cell };
            }
        }
    }
}

/// Release out-of-heap resources before the sweep returns a cell to the
/// free list.
///
/// # Safety
/// `cell` must point to a constructed cell that is about to be reclaimed;
/// no live reference to it may remain.
pub(crate) unsafe fn finalize(cell: *mut Cell) {
    match unsafe { &mut (*cell).body } {
        CellBody::ByteBuffer(n) => {
            if n.owned && !n.data.is_null() {
                unsafe { libc::free(n.data as *mut libc::c_void) };
                n.data = std::ptr::null_mut();
            }
        }
        CellBody::Thread(n) => {
            if !n.method_cache.is_null() {
                drop(unsafe {
                    Box::from_raw(n.method_cache as *mut [MethodCacheEntry; THREAD_CACHE_DEPTH])
                });
                n.method_cache = std::ptr::null_mut();
            }
            if !n.os_thread.is_null() {
                drop(unsafe { Box::from_raw(n.os_thread) });
                n.os_thread = std::ptr::null_mut();
            }
        }
        _ => {}
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_is_exactly_64_bytes() {
        assert_eq!(std::mem::size_of::<Cell>(), 64);
        assert_eq!(std::mem::align_of::<Cell>(), 64);
    }

    #[test]
    fn test_payload_sizes_fit() {
        // Everything must fit behind the 8-byte link and 8-byte discriminant.
        assert!(std::mem::size_of::<ListNode>() <= 48);
        assert!(std::mem::size_of::<SparseNode>() <= 48);
        assert!(std::mem::size_of::<TupleNode>() <= 48);
        assert!(std::mem::size_of::<ThreadNode>() <= 48);
        assert!(std::mem::size_of::<ObjectNode>() <= 48);
        assert!(std::mem::size_of::<TupleDictNode>() <= 48);
        assert!(std::mem::size_of::<BufferNode>() <= 48);
    }

    #[test]
    fn test_zeroed_memory_is_a_free_cell() {
        let zeroed: Cell = unsafe { std::mem::zeroed() };
        assert!(matches!(zeroed.body, CellBody::Free));
        assert!(zeroed.next_cell.is_null());
    }

    #[test]
    fn test_count_height_packing() {
        let packed = pack_count_height(123_456, 17);
        assert_eq!(unpack_count(packed), 123_456);
        assert_eq!(unpack_height(packed), 17);

        let max = pack_count_height(COUNT_MASK, 255);
        assert_eq!(unpack_count(max), COUNT_MASK);
        assert_eq!(unpack_height(max), 255);
    }

    #[test]
    fn test_method_cache_entry_size() {
        assert_eq!(std::mem::size_of::<MethodCacheEntry>(), 24);
    }
}
