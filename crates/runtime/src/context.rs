//! Execution Contexts
//!
//! A `Context` is the per-call-frame record of the runtime: it chains every
//! cell the frame allocates, optionally registers a block of local-variable
//! slots as GC roots, and hands its allocation chain to the Space as a dirty
//! segment when the frame ends.
//!
//! Values that must survive a collection across a safepoint have to be
//! reachable from a registered locals slot or from a container that is; a
//! value held only in a host-language local is invisible to the collector
//! once its cell has been flushed to a dirty segment.

use crate::buffer::{ProtoByteBuffer, ProtoExternalPointer};
use crate::cell::{Cell, CellBody};
use crate::list::ProtoList;
use crate::method::{ProtoMethod, ProtoMethodCell};
use crate::object::ProtoObject;
use crate::space::Space;
use crate::sparse::ProtoSparseMap;
use crate::string::ProtoString;
use crate::thread;
use crate::tuple::ProtoTuple;
use proto_core::Value;
use std::ptr;

/// Per-call-frame record: allocation chain, locals roots, back-pressure
/// counter.
pub struct Context {
    pub(crate) previous: *mut Context,
    pub(crate) space: *const Space,
    pub(crate) thread: *mut Cell,
    pub(crate) last_allocated_cell: *mut Cell,
    pub(crate) allocated_cells_count: u32,
    pub(crate) locals_base: *mut Value,
    pub(crate) locals_count: u32,
}

impl Context {
    /// A frame with no owning thread. Used while bootstrapping a Space and
    /// by the collector; allocation goes through the global free list.
    pub(crate) fn bootstrap(space: *const Space) -> Context {
        Context {
            previous: ptr::null_mut(),
            space,
            thread: ptr::null_mut(),
            last_allocated_cell: ptr::null_mut(),
            allocated_cells_count: 0,
            locals_base: ptr::null_mut(),
            locals_count: 0,
        }
    }

    /// The root frame of a thread.
    pub(crate) fn root(space: *const Space, thread: *mut Cell) -> Context {
        Context {
            previous: ptr::null_mut(),
            space,
            thread,
            last_allocated_cell: ptr::null_mut(),
            allocated_cells_count: 0,
            locals_base: ptr::null_mut(),
            locals_count: 0,
        }
    }

    /// A child frame inheriting space and thread from its caller.
    pub fn frame(previous: &mut Context) -> Context {
        Context {
            previous: previous as *mut Context,
            space: previous.space,
            thread: previous.thread,
            last_allocated_cell: ptr::null_mut(),
            allocated_cells_count: 0,
            locals_base: ptr::null_mut(),
            locals_count: 0,
        }
    }

    /// A child frame with a block of local slots registered as GC roots.
    ///
    /// The slots are cleared to the none value; the caller must keep the
    /// backing storage alive for the lifetime of the frame.
    pub fn frame_with_locals(previous: &mut Context, locals: &mut [Value]) -> Context {
        for slot in locals.iter_mut() {
            *slot = Value::NONE;
        }
        Context {
            previous: previous as *mut Context,
            space: previous.space,
            thread: previous.thread,
            last_allocated_cell: ptr::null_mut(),
            allocated_cells_count: 0,
            locals_base: locals.as_mut_ptr(),
            locals_count: locals.len() as u32,
        }
    }

    /// The Space this frame allocates from.
    #[inline(always)]
    pub fn space(&self) -> &Space {
        unsafe { &*self.space }
    }

    /// Store a value in a registered locals slot, rooting it for the
    /// collector. Out-of-range slots are ignored.
    pub fn set_local(&mut self, index: usize, value: Value) {
        if index < self.locals_count as usize {
            unsafe { *self.locals_base.add(index) = value };
        }
    }

    /// Read a registered locals slot; none when out of range.
    pub fn get_local(&self, index: usize) -> Value {
        if index < self.locals_count as usize {
            unsafe { *self.locals_base.add(index) }
        } else {
            Value::NONE
        }
    }

    /// The thread cell running this frame, null for bootstrap frames.
    #[inline(always)]
    pub(crate) fn thread_cell(&self) -> *mut Cell {
        self.thread
    }

    /// The thread running this frame; `None` for bootstrap frames.
    pub fn current_thread(&self) -> Option<crate::thread::ProtoThread> {
        if self.thread.is_null() {
            None
        } else {
            Some(crate::thread::ProtoThread(self.thread))
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate one cell, link it into this frame's chain and publish this
    /// frame as the thread's current context.
    pub(crate) fn alloc_cell(&mut self, body: CellBody) -> *mut Cell {
        let cell = if self.thread.is_null() {
            self.space().alloc_unpooled_cell()
        } else {
            thread::alloc_from_pool(self)
        };

        unsafe {
            ptr::write(&mut (*cell).body, body);
            (*cell).next_cell = self.last_allocated_cell;
        }
        self.last_allocated_cell = cell;
        self.allocated_cells_count += 1;

        // The frame's resting address is only known at use time, so the
        // thread's current-context pointer is refreshed on every allocation.
        if !self.thread.is_null() {
            thread::set_current_context(self.thread, self);
        }

        self.check_cells_count();
        cell
    }

    /// Hand the chain to the collector once the frame has allocated enough,
    /// and wake the collector.
    fn check_cells_count(&mut self) {
        let max = self.space().config.max_allocated_cells_per_context;
        if self.allocated_cells_count as usize >= max {
            self.space().analyze_used_cells(self.last_allocated_cell);
            self.last_allocated_cell = ptr::null_mut();
            self.allocated_cells_count = 0;
            self.space().trigger_gc();
        }
    }

    // =========================================================================
    // Constructors for allocated kinds
    // =========================================================================

    /// A new empty persistent list.
    pub fn new_list(&mut self) -> ProtoList {
        ProtoList::new(self)
    }

    /// A new empty persistent sparse map.
    pub fn new_sparse_map(&mut self) -> ProtoSparseMap {
        ProtoSparseMap::new(self)
    }

    /// The canonical empty tuple.
    pub fn new_tuple(&mut self) -> ProtoTuple {
        let empty = ProtoList::new(self);
        ProtoTuple::from_list(self, empty)
    }

    /// The canonical tuple holding the elements of `list`.
    pub fn new_tuple_from_list(&mut self, list: ProtoList) -> ProtoTuple {
        ProtoTuple::from_list(self, list)
    }

    /// A fresh object with no parents and no attributes. A mutable object
    /// draws a fresh id and is published in the mutable-reference table.
    pub fn new_object(&mut self, is_mutable: bool) -> ProtoObject {
        ProtoObject::new(self, is_mutable)
    }

    /// The canonical string for a UTF-8 byte sequence.
    pub fn from_utf8_string(&mut self, text: &str) -> ProtoString {
        ProtoString::from_utf8(self, text.as_bytes())
    }

    /// Wrap a native method as a first-class value.
    pub fn from_method(&mut self, method: ProtoMethod) -> ProtoMethodCell {
        ProtoMethodCell::new(self, method)
    }

    /// Wrap an opaque pointer the collector will never follow.
    pub fn from_external_pointer(&mut self, pointer: *mut libc::c_void) -> ProtoExternalPointer {
        ProtoExternalPointer::new(self, pointer)
    }

    /// A byte buffer owning `length` zeroed bytes.
    pub fn new_buffer(&mut self, length: usize) -> ProtoByteBuffer {
        ProtoByteBuffer::new(self, length)
    }

    /// A byte buffer wrapping caller-owned memory.
    ///
    /// # Safety
    /// `data` must stay valid for the lifetime of the buffer cell.
    pub unsafe fn from_buffer(&mut self, length: usize, data: *mut u8) -> ProtoByteBuffer {
        unsafe { ProtoByteBuffer::wrap(self, length, data) }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Non-root frames hand their chain to the Space for analysis; root
        // frames keep theirs alive for the life of the thread.
        if !self.previous.is_null() && !self.last_allocated_cell.is_null() {
            self.space().analyze_used_cells(self.last_allocated_cell);
            self.last_allocated_cell = ptr::null_mut();
        }
        if !self.thread.is_null() {
            thread::set_current_context(self.thread, self.previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::SpaceConfig;

    #[test]
    fn test_frame_chain_inherits_space_and_thread() {
        let space = Space::new(SpaceConfig::default());
        let thread = space.adopt_current_thread("ctx-test");
        let mut root = Context::root(&*space, thread.cell());
        {
            let mut child = Context::frame(&mut root);
            assert_eq!(child.space, root.space);
            assert_eq!(child.thread, root.thread);
            let list = child.new_list();
            assert_eq!(list.get_size(), 0);
        }
        space.release_current_thread(&mut root);
    }

    #[test]
    fn test_locals_are_cleared() {
        let space = Space::new(SpaceConfig::default());
        let thread = space.adopt_current_thread("locals-test");
        let mut root = Context::root(&*space, thread.cell());
        let mut locals = [Value::from_small_int(7); 4];
        {
            let ctx = Context::frame_with_locals(&mut root, &mut locals);
            assert_eq!(ctx.locals_count, 4);
            for i in 0..4 {
                assert!(unsafe { *ctx.locals_base.add(i) }.is_none());
            }
        }
        space.release_current_thread(&mut root);
    }
}
