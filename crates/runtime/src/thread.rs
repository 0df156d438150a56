//! Threads and Method Dispatch
//!
//! An application thread is itself a cell: name, current context, private
//! free-cell pool, handshake state, unmanaged-nesting counter and a
//! direct-mapped method cache. Allocation takes the head of the thread's
//! pool without locking; refills synchronize with the collector (the
//! safepoint) and then pull a block of cells from the global free list.
//!
//! A thread that is about to block outside the runtime declares itself
//! unmanaged (nestable); the collector pins its roots instead of waiting
//! for it. On returning to managed it immediately safepoints, so an
//! in-progress collection is honored.

use crate::cell::{
    Cell, CellBody, MethodCacheEntry, THREAD_CACHE_DEPTH, ThreadNode, cell_value,
};
use crate::context::Context;
use crate::list::ProtoList;
use crate::method::{ProtoMethod, ProtoMethodCell};
use crate::object::ProtoObject;
use crate::space::{
    SPACE_STATE_RUNNING, SPACE_STATE_STOPPING_WORLD, SPACE_STATE_WORLD_TO_STOP, Space,
};
use crate::sparse::ProtoSparseMap;
use crate::string::ProtoString;
use proto_core::{PointerTag, Value};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

// Thread states with respect to the collector.
pub(crate) const THREAD_STATE_UNMANAGED: u32 = 0;
pub(crate) const THREAD_STATE_MANAGED: u32 = 1;
pub(crate) const THREAD_STATE_STOPPING: u32 = 2;
pub(crate) const THREAD_STATE_STOPPED: u32 = 3;
pub(crate) const THREAD_STATE_ENDED: u32 = 4;

// Process-lifetime counters for the at-exit report.
pub(crate) static TOTAL_THREADS_SPAWNED: AtomicU64 = AtomicU64::new(0);
pub(crate) static PEAK_THREADS: AtomicUsize = AtomicUsize::new(0);

#[inline(always)]
pub(crate) fn thread_node<'a>(cell: *mut Cell) -> &'a ThreadNode {
    unsafe {
        match &(*cell).body {
            CellBody::Thread(n) => n,
            _ => unreachable!("thread cell expected"),
        }
    }
}

#[inline(always)]
fn thread_node_mut<'a>(cell: *mut Cell) -> &'a mut ThreadNode {
    unsafe {
        match &mut (*cell).body {
            CellBody::Thread(n) => n,
            _ => unreachable!("thread cell expected"),
        }
    }
}

/// Publish `ctx` as the thread's current frame. Called on every allocation
/// so the pointer always names the frame's resting address.
pub(crate) fn set_current_context(thread: *mut Cell, ctx: *mut Context) {
    thread_node_mut(thread).current_context = ctx;
}

/// Take one cell from the thread-local pool; on exhaustion, safepoint and
/// pull a refill from the global free list.
pub(crate) fn alloc_from_pool(ctx: &mut Context) -> *mut Cell {
    let thread = ctx.thread_cell();
    let node = thread_node_mut(thread);
    if node.free_cells.is_null() {
        let space = ctx.space();
        sync_to_gc(space, thread);
        node.free_cells = space.get_free_cells(thread);
    }
    let cell = node.free_cells;
    node.free_cells = unsafe { (*cell).next_cell };
    unsafe { (*cell).next_cell = ptr::null_mut() };
    cell
}

/// The safepoint: cooperate with an in-progress stop-the-world request.
///
/// MANAGED -> STOPPING (collector may advance), wait for WORLD_TO_STOP,
/// STOPPING -> STOPPED, wait for RUNNING, STOPPED -> MANAGED.
pub(crate) fn sync_to_gc(space: &Space, thread: *mut Cell) {
    let node = thread_node(thread);
    if node.state.load(Ordering::Acquire) != THREAD_STATE_MANAGED {
        return;
    }
    let observed = space.space_state();
    if observed != SPACE_STATE_STOPPING_WORLD && observed != SPACE_STATE_WORLD_TO_STOP {
        return;
    }

    let mut guard = space
        .global_mutex
        .lock()
        .unwrap_or_else(|e| e.into_inner());

    node.state.store(THREAD_STATE_STOPPING, Ordering::Release);
    space.stop_the_world.notify_all();

    loop {
        let state = space.space_state();
        if state == SPACE_STATE_WORLD_TO_STOP {
            break;
        }
        if state == SPACE_STATE_RUNNING {
            // The collection finished without needing this thread.
            node.state.store(THREAD_STATE_MANAGED, Ordering::Release);
            return;
        }
        let (g, _) = space
            .restart_the_world
            .wait_timeout(guard, Duration::from_millis(10))
            .unwrap_or_else(|e| e.into_inner());
        guard = g;
    }

    node.state.store(THREAD_STATE_STOPPED, Ordering::Release);
    space.stop_the_world.notify_all();

    while space.space_state() != SPACE_STATE_RUNNING {
        let (g, _) = space
            .restart_the_world
            .wait_timeout(guard, Duration::from_millis(10))
            .unwrap_or_else(|e| e.into_inner());
        guard = g;
    }

    node.state.store(THREAD_STATE_MANAGED, Ordering::Release);
}

// =============================================================================
// ProtoThread
// =============================================================================

/// Handle to a thread cell.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProtoThread(pub(crate) *mut Cell);

/// Everything a spawned OS thread needs, shipped across the spawn boundary.
struct ThreadStart {
    space: *const Space,
    thread: *mut Cell,
    target: ProtoMethod,
    args: Value,
    kwargs: Value,
}

// Safety: the pointers reference the Space (which outlives every thread it
// joins) and managed cells reachable from the spawning frame.
unsafe impl Send for ThreadStart {}

fn thread_main(start: ThreadStart) {
    let space = unsafe { &*start.space };
    let mut ctx = Context::root(start.space, start.thread);
    set_current_context(start.thread, &mut ctx);

    let args = ProtoList::from_value(start.args)
        .unwrap_or_else(|| ProtoList::new(&mut ctx));
    let kwargs = ProtoSparseMap::from_value(start.kwargs)
        .unwrap_or_else(|| ProtoSparseMap::new(&mut ctx));

    let self_value = unsafe { cell_value(start.thread) };
    (start.target)(&mut ctx, self_value, ptr::null_mut(), args, kwargs);

    // The thread is done: leave the registry and the handshake.
    let name_hash = thread_node(start.thread).name.hash();
    space.deregister_thread(&mut ctx, name_hash);
    thread_node(start.thread)
        .state
        .store(THREAD_STATE_ENDED, Ordering::Release);
    space.stop_the_world.notify_all();
}

impl ProtoThread {
    pub(crate) fn cell(self) -> *mut Cell {
        self.0
    }

    pub fn as_value(self) -> Value {
        unsafe { cell_value(self.0) }
    }

    pub fn from_value(v: Value) -> Option<ProtoThread> {
        if v.tag() == PointerTag::Thread as u8 && !v.is_none() {
            Some(ProtoThread(v.cell_address() as *mut Cell))
        } else {
            None
        }
    }

    /// The thread's name value.
    pub fn get_name(self) -> Value {
        thread_node(self.0).name
    }

    pub fn get_hash(self) -> u64 {
        unsafe { (*self.0).hash() }
    }

    pub(crate) fn state(self) -> u32 {
        thread_node(self.0).state.load(Ordering::Acquire)
    }

    /// Block until the OS thread finishes. The calling thread declares
    /// itself unmanaged for the duration so the collector never waits on a
    /// joiner.
    pub fn join(self, ctx: &mut Context) {
        let handle = {
            let node = thread_node_mut(self.0);
            let handle = node.os_thread;
            node.os_thread = ptr::null_mut();
            handle
        };
        if handle.is_null() {
            return;
        }
        let caller = ctx.thread_cell();
        if !caller.is_null() {
            ProtoThread(caller).set_unmanaged();
        }
        let _ = unsafe { Box::from_raw(handle) }.join();
        if !caller.is_null() {
            ProtoThread(caller).set_managed(ctx.space());
        }
    }

    /// Let the OS thread run to completion on its own.
    pub fn detach(self, _ctx: &mut Context) {
        let node = thread_node_mut(self.0);
        if !node.os_thread.is_null() {
            drop(unsafe { Box::from_raw(node.os_thread) });
            node.os_thread = ptr::null_mut();
        }
    }

    /// Deregister and end the calling thread. Valid only for the thread
    /// itself.
    pub fn exit(self, ctx: &mut Context) {
        debug_assert_eq!(
            ctx.thread_cell(),
            self.0,
            "exit is valid only for the calling thread"
        );
        let name_hash = thread_node(self.0).name.hash();
        let space = unsafe { &*ctx.space };
        space.deregister_thread(ctx, name_hash);
        thread_node(self.0)
            .state
            .store(THREAD_STATE_ENDED, Ordering::Release);
    }

    /// Enter the unmanaged state (nestable). An unmanaged thread must not
    /// touch managed memory until it declares itself managed again.
    pub fn set_unmanaged(self) {
        let node = thread_node_mut(self.0);
        node.unmanaged_count += 1;
        node.state.store(THREAD_STATE_UNMANAGED, Ordering::Release);
    }

    /// Leave the unmanaged state; safepoints immediately if a collection is
    /// in progress.
    pub fn set_managed(self, space: &Space) {
        let node = thread_node_mut(self.0);
        if node.unmanaged_count > 0 {
            node.unmanaged_count -= 1;
        }
        if node.unmanaged_count == 0 {
            node.state.store(THREAD_STATE_MANAGED, Ordering::Release);
            sync_to_gc(space, self.0);
        }
    }

    /// Explicit safepoint poll.
    pub fn sync(self, space: &Space) {
        sync_to_gc(space, self.0);
    }
}

fn new_thread_cell(ctx: &mut Context, name: ProtoString) -> *mut Cell {
    let cache =
        Box::into_raw(Box::new([MethodCacheEntry::EMPTY; THREAD_CACHE_DEPTH])) as *mut MethodCacheEntry;
    ctx.alloc_cell(CellBody::Thread(ThreadNode {
        name: name.as_value(),
        current_context: ptr::null_mut(),
        free_cells: ptr::null_mut(),
        state: AtomicU32::new(THREAD_STATE_MANAGED),
        unmanaged_count: 0,
        method_cache: cache,
        os_thread: ptr::null_mut(),
    }))
}

fn note_thread_spawned(space: &Space) {
    TOTAL_THREADS_SPAWNED.fetch_add(1, Ordering::Relaxed);
    let live = space.thread_registry().get_size() as usize;
    PEAK_THREADS.fetch_max(live, Ordering::Relaxed);
}

impl Space {
    /// Full entry point for a host program: build a Space, run `main` on a
    /// fresh thread with positional arguments `[argc, [argv...]]`, join it,
    /// shut the Space down and emit the at-exit report.
    pub fn run(config: crate::space::SpaceConfig, main: ProtoMethod, argv: &[&str]) {
        #[cfg(feature = "diagnostics")]
        crate::diagnostics::install_signal_handler();

        let space = Space::new(config);
        {
            let mut boot = Context::bootstrap(&*space);

            let mut parameters = ProtoList::new(&mut boot);
            parameters =
                parameters.append_last(&mut boot, Value::from_small_int(argv.len() as i64));
            let mut argv_list = ProtoList::new(&mut boot);
            for arg in argv {
                let s = ProtoString::from_utf8(&mut boot, arg.as_bytes());
                argv_list = argv_list.append_last(&mut boot, s.as_value());
            }
            parameters = parameters.append_last(&mut boot, argv_list.as_value());

            let name = ProtoString::from_utf8(&mut boot, b"Main thread");
            let kwargs = ProtoSparseMap::new(&mut boot);
            let main_thread = space.new_thread(&mut boot, name, main, parameters, kwargs);
            main_thread.join(&mut boot);
        }
        drop(space);
        crate::report::emit_report();
    }

    /// Create and start a managed thread running `target` with the given
    /// arguments; the thread registers itself under the hash of its name.
    pub fn new_thread(
        &self,
        ctx: &mut Context,
        name: ProtoString,
        target: ProtoMethod,
        args: ProtoList,
        kwargs: ProtoSparseMap,
    ) -> ProtoThread {
        let cell = new_thread_cell(ctx, name);
        self.register_thread(ctx, name.as_value().hash(), unsafe { cell_value(cell) });
        note_thread_spawned(self);

        let start = ThreadStart {
            space: self,
            thread: cell,
            target,
            args: args.as_value(),
            kwargs: kwargs.as_value(),
        };
        let handle = std::thread::Builder::new()
            .name(name.to_utf8_string())
            .spawn(move || thread_main(start))
            .unwrap_or_else(|e| {
                eprintln!("PANIC ERROR: cannot start thread: {e}! Exiting ...");
                std::process::abort();
            });
        thread_node_mut(cell).os_thread = Box::into_raw(Box::new(handle));
        ProtoThread(cell)
    }

    /// Register the calling OS thread as a managed thread. Used by hosts
    /// and tests; the cell is allocated outside any collectable frame.
    pub fn adopt_current_thread(&self, name: &str) -> ProtoThread {
        let mut boot = Context::bootstrap(self);
        let name = ProtoString::from_utf8(&mut boot, name.as_bytes());
        let cell = new_thread_cell(&mut boot, name);
        self.register_thread(&mut boot, name.as_value().hash(), unsafe {
            cell_value(cell)
        });
        note_thread_spawned(self);
        ProtoThread(cell)
    }

    /// Deregister the thread owning `ctx`; the inverse of
    /// `adopt_current_thread`.
    pub fn release_current_thread(&self, ctx: &mut Context) {
        let thread = ctx.thread_cell();
        if thread.is_null() {
            return;
        }
        let name_hash = thread_node(thread).name.hash();
        self.deregister_thread(ctx, name_hash);
        thread_node(thread)
            .state
            .store(THREAD_STATE_ENDED, Ordering::Release);
        self.stop_the_world.notify_all();
    }

    /// The root frame for a thread adopted or spawned in this Space. The
    /// frame announces itself as the thread's current context on its first
    /// allocation, once its resting address is known.
    pub fn root_context(&self, thread: ProtoThread) -> Context {
        Context::root(self, thread.cell())
    }
}

// =============================================================================
// Method dispatch
// =============================================================================

/// Resolve the attribute and keep it only if it is a method cell.
fn resolve_method(ctx: &mut Context, object: Value, name: ProtoString) -> Option<ProtoMethod> {
    let resolved = ProtoObject::from_value(object).get_attribute(ctx, name);
    ProtoMethodCell::from_value(resolved).map(|m| m.get_method())
}

/// Method dispatch through the calling thread's cache.
///
/// The cache is direct-mapped on `((hash(object) ^ hash(name)) >> 4)`; a
/// miss runs full attribute-chain resolution and stores the result. Entries
/// are GC roots, so a cached receiver stays alive.
pub fn call(
    ctx: &mut Context,
    object: Value,
    name: ProtoString,
    args: ProtoList,
    kwargs: ProtoSparseMap,
) -> Value {
    let thread = ctx.thread_cell();
    let method = if thread.is_null() {
        resolve_method(ctx, object, name)
    } else {
        let slot = (((object.hash() ^ name.as_value().hash()) >> 4)
            & (THREAD_CACHE_DEPTH as u64 - 1)) as usize;
        let cache = thread_node(thread).method_cache;
        let entry = unsafe { &mut *cache.add(slot) };
        if entry.object != object || entry.method_name != name.as_value() {
            entry.object = object;
            entry.method_name = name.as_value();
            entry.method = resolve_method(ctx, object, name);
        }
        entry.method
    };
    match method {
        Some(method) => method(ctx, object, ptr::null_mut(), args, kwargs),
        None => Value::NONE,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::SpaceConfig;
    use crate::test_support::with_context;

    #[test]
    fn test_adopted_thread_is_registered() {
        let space = Space::new(SpaceConfig::default());
        let thread = space.adopt_current_thread("worker");
        assert_eq!(thread.state(), THREAD_STATE_MANAGED);
        assert!(space.thread_registry().has(thread.get_name().hash()));

        let mut ctx = space.root_context(thread);
        space.release_current_thread(&mut ctx);
        assert_eq!(thread.state(), THREAD_STATE_ENDED);
        assert!(!space.thread_registry().has(thread.get_name().hash()));
    }

    #[test]
    fn test_unmanaged_nesting() {
        let space = Space::new(SpaceConfig::default());
        let thread = space.adopt_current_thread("nested");
        thread.set_unmanaged();
        thread.set_unmanaged();
        assert_eq!(thread.state(), THREAD_STATE_UNMANAGED);
        thread.set_managed(&space);
        assert_eq!(thread.state(), THREAD_STATE_UNMANAGED);
        thread.set_managed(&space);
        assert_eq!(thread.state(), THREAD_STATE_MANAGED);

        let mut ctx = space.root_context(thread);
        space.release_current_thread(&mut ctx);
    }

    fn echo_first(
        _ctx: &mut Context,
        _self: Value,
        _parent: *mut Cell,
        args: ProtoList,
        _kwargs: ProtoSparseMap,
    ) -> Value {
        args.get_at(0)
    }

    #[test]
    fn test_spawn_and_join() {
        with_context(|ctx| {
            let name = ctx.from_utf8_string("spawned");
            let mut args = ctx.new_list();
            args = args.append_last(ctx, Value::from_small_int(99));
            let kwargs = ctx.new_sparse_map();
            let space: *const Space = ctx.space();
            let thread = unsafe { &*space }.new_thread(ctx, name, echo_first, args, kwargs);
            thread.join(ctx);
            assert_eq!(thread.state(), THREAD_STATE_ENDED);
            // The spawned thread deregistered itself.
            assert!(!unsafe { &*space }.thread_registry().has(name.as_value().hash()));
        });
    }

    #[test]
    fn test_method_cache_dispatch() {
        with_context(|ctx| {
            let greet = ctx.from_utf8_string("first");
            let method = ctx.from_method(echo_first).as_value();
            let object = ctx.new_object(false).set_attribute(ctx, greet, method);

            let mut args = ctx.new_list();
            args = args.append_last(ctx, Value::from_small_int(7));
            let kwargs = ctx.new_sparse_map();

            // Miss, then hit: both must dispatch.
            let first = call(ctx, object.as_value(), greet, args, kwargs);
            assert_eq!(first.as_small_int(), 7);
            let second = call(ctx, object.as_value(), greet, args, kwargs);
            assert_eq!(second.as_small_int(), 7);

            // Unresolvable names dispatch to none.
            let missing = ctx.from_utf8_string("missing");
            let none = call(ctx, object.as_value(), missing, args, kwargs);
            assert!(none.is_none());
        });
    }
}
