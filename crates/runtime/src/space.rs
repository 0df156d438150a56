//! The Space
//!
//! The process-wide runtime instance: it owns the heap (page-aligned blocks
//! of 64-byte cells on a global free list), the dirty-segment queue awaiting
//! collection, the thread registry, the tuple and string interning roots,
//! the mutable-reference table, the prototype table and the stop-the-world
//! handshake machinery.
//!
//! Locking discipline: `free_cells`, `dirty_segments` and the block list are
//! guarded by the `gc_lock` spinlock; the thread registry by `threads_lock`;
//! the interning and mutable roots are shared-read, CAS-write; the handshake
//! uses one mutex and three condition variables. Everything else is
//! immutable after bootstrap.

use crate::cell::Cell;
use crate::context::Context;
use crate::object::ProtoObject;
use crate::sparse::ProtoSparseMap;
use proto_core::{EmbeddedType, PointerTag, Value};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;

// Space states driving the stop-the-world handshake.
pub(crate) const SPACE_STATE_RUNNING: u32 = 0;
pub(crate) const SPACE_STATE_STOPPING_WORLD: u32 = 1;
pub(crate) const SPACE_STATE_WORLD_TO_STOP: u32 = 2;
pub(crate) const SPACE_STATE_WORLD_STOPPED: u32 = 3;
pub(crate) const SPACE_STATE_ENDING: u32 = 4;

/// Cells handed to a thread-local pool per global free-list refill.
const BLOCKS_PER_ALLOCATION: usize = 1024;

/// Cells requested from the OS per block allocation.
const BLOCKS_PER_MALLOC_REQUEST: usize = 8 * BLOCKS_PER_ALLOCATION;

const MAX_ALLOCATED_CELLS_PER_CONTEXT: usize = 1024;

const KB: usize = 1024;
const MB: usize = 1024 * KB;
const MAX_HEAP_SIZE: usize = 512 * MB;

const GC_SLEEP_MILLISECONDS: u64 = 1000;

// Process-lifetime counters for the at-exit report.
pub(crate) static TOTAL_CELLS_ALLOCATED: AtomicU64 = AtomicU64::new(0);
pub(crate) static PEAK_HEAP_BYTES: AtomicUsize = AtomicUsize::new(0);

// =============================================================================
// Configuration
// =============================================================================

/// Host-visible tuneables, overridable through `PROTO_*` environment
/// variables.
#[derive(Debug, Clone)]
pub struct SpaceConfig {
    /// Allocation count per frame before the chain is handed to the
    /// collector and a background collection is triggered.
    pub max_allocated_cells_per_context: usize,
    /// Cells drawn per thread-local free-pool refill.
    pub blocks_per_allocation: usize,
    /// Cells requested from the OS per block allocation.
    pub blocks_per_malloc_request: usize,
    /// Hard heap cap in bytes; 0 means unbounded.
    pub max_heap_size: usize,
    /// On cap: block on the collector instead of aborting.
    pub block_on_no_memory: bool,
    /// Collector idle period between scans.
    pub gc_sleep_milliseconds: u64,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        SpaceConfig {
            max_allocated_cells_per_context: MAX_ALLOCATED_CELLS_PER_CONTEXT,
            blocks_per_allocation: BLOCKS_PER_ALLOCATION,
            blocks_per_malloc_request: BLOCKS_PER_MALLOC_REQUEST,
            max_heap_size: MAX_HEAP_SIZE,
            block_on_no_memory: false,
            gc_sleep_milliseconds: GC_SLEEP_MILLISECONDS,
        }
    }
}

impl SpaceConfig {
    /// The defaults with any `PROTO_*` environment overrides applied.
    pub fn from_env() -> SpaceConfig {
        fn parse<T: std::str::FromStr>(name: &str, default: T) -> T {
            match std::env::var(name) {
                Ok(raw) => raw.parse().unwrap_or_else(|_| {
                    eprintln!("Warning: {name}='{raw}' not recognized, ignoring");
                    default
                }),
                Err(_) => default,
            }
        }
        let defaults = SpaceConfig::default();
        SpaceConfig {
            max_allocated_cells_per_context: parse(
                "PROTO_MAX_ALLOCATED_CELLS_PER_CONTEXT",
                defaults.max_allocated_cells_per_context,
            ),
            blocks_per_allocation: parse(
                "PROTO_BLOCKS_PER_ALLOCATION",
                defaults.blocks_per_allocation,
            ),
            blocks_per_malloc_request: parse(
                "PROTO_BLOCKS_PER_MALLOC_REQUEST",
                defaults.blocks_per_malloc_request,
            ),
            max_heap_size: parse("PROTO_MAX_HEAP_SIZE", defaults.max_heap_size),
            block_on_no_memory: parse("PROTO_BLOCK_ON_NO_MEMORY", defaults.block_on_no_memory),
            gc_sleep_milliseconds: parse(
                "PROTO_GC_SLEEP_MILLISECONDS",
                defaults.gc_sleep_milliseconds,
            ),
        }
    }
}

// =============================================================================
// Spinlock
// =============================================================================

/// Bounded-wait spin-and-yield lock guarding the short critical sections of
/// the allocator.
pub(crate) struct SpinLock(AtomicBool);

impl SpinLock {
    const fn new() -> SpinLock {
        SpinLock(AtomicBool::new(false))
    }

    pub(crate) fn lock(&self) -> SpinGuard<'_> {
        while self
            .0
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
        }
        SpinGuard(self)
    }
}

pub(crate) struct SpinGuard<'a>(&'a SpinLock);

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.0.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Dirty segments
// =============================================================================

/// One frame's allocation chain, queued for the collector.
pub(crate) struct DirtySegment {
    pub(crate) head: *mut Cell,
    pub(crate) next: *mut DirtySegment,
}

// =============================================================================
// Prototype table
// =============================================================================

/// One prototype object per pointer tag and embedded type; Space-global GC
/// roots.
pub(crate) struct Prototypes {
    pub object: Value,
    pub none: Value,
    pub boolean: Value,
    pub small_int: Value,
    pub float: Value,
    pub unicode_char: Value,
    pub byte: Value,
    pub date: Value,
    pub timestamp: Value,
    pub timedelta: Value,
    pub list: Value,
    pub list_iterator: Value,
    pub tuple: Value,
    pub tuple_iterator: Value,
    pub string: Value,
    pub string_iterator: Value,
    pub sparse_map: Value,
    pub sparse_map_iterator: Value,
    pub byte_buffer: Value,
    pub external_pointer: Value,
    pub method: Value,
    pub thread: Value,
}

impl Prototypes {
    fn bootstrap(ctx: &mut Context) -> Prototypes {
        let mut fresh = || ProtoObject::new(ctx, false).as_value();
        Prototypes {
            object: fresh(),
            none: fresh(),
            boolean: fresh(),
            small_int: fresh(),
            float: fresh(),
            unicode_char: fresh(),
            byte: fresh(),
            date: fresh(),
            timestamp: fresh(),
            timedelta: fresh(),
            list: fresh(),
            list_iterator: fresh(),
            tuple: fresh(),
            tuple_iterator: fresh(),
            string: fresh(),
            string_iterator: fresh(),
            sparse_map: fresh(),
            sparse_map_iterator: fresh(),
            byte_buffer: fresh(),
            external_pointer: fresh(),
            method: fresh(),
            thread: fresh(),
        }
    }

    pub(crate) fn for_each(&self, visit: &mut dyn FnMut(Value)) {
        for v in [
            self.object,
            self.none,
            self.boolean,
            self.small_int,
            self.float,
            self.unicode_char,
            self.byte,
            self.date,
            self.timestamp,
            self.timedelta,
            self.list,
            self.list_iterator,
            self.tuple,
            self.tuple_iterator,
            self.string,
            self.string_iterator,
            self.sparse_map,
            self.sparse_map_iterator,
            self.byte_buffer,
            self.external_pointer,
            self.method,
            self.thread,
        ] {
            visit(v);
        }
    }
}

// =============================================================================
// Space
// =============================================================================

/// The process-wide runtime instance.
pub struct Space {
    pub(crate) config: SpaceConfig,
    pub(crate) state: AtomicU32,

    // Handshake machinery: one mutex, three condition variables.
    pub(crate) global_mutex: Mutex<()>,
    pub(crate) stop_the_world: Condvar,
    pub(crate) restart_the_world: Condvar,
    pub(crate) gc_wakeup: Condvar,
    pub(crate) gc_started: AtomicBool,

    // Allocator state, guarded by `gc_lock`.
    gc_lock: SpinLock,
    free_cells: UnsafeCell<*mut Cell>,
    dirty_segments: UnsafeCell<*mut DirtySegment>,
    allocated_blocks: UnsafeCell<Vec<*mut libc::c_void>>,
    pub(crate) free_cells_count: AtomicI64,
    pub(crate) heap_size: AtomicUsize,

    // Thread registry: a persistent sparse map keyed by thread-name hash,
    // mutated under `threads_lock`, snapshot-read by the collector.
    threads_lock: SpinLock,
    pub(crate) threads: AtomicPtr<Cell>,

    // Space-global persistent roots, shared-read, CAS-write.
    pub(crate) tuple_root: AtomicPtr<Cell>,
    pub(crate) string_root: AtomicPtr<Cell>,
    pub(crate) mutable_root: AtomicPtr<Cell>,

    prototypes: UnsafeCell<Prototypes>,
    gc_thread: UnsafeCell<Option<JoinHandle<()>>>,
    bootstrap_context: UnsafeCell<*mut Context>,
}

// Safety: interior-mutable fields follow the locking discipline documented
// on the struct; the raw pointers reference the managed heap, which the
// Space itself owns.
unsafe impl Send for Space {}
unsafe impl Sync for Space {}

impl Space {
    /// Create a Space: bootstrap its persistent roots and prototype table
    /// and start the collector thread.
    pub fn new(config: SpaceConfig) -> Box<Space> {
        let space = Box::new(Space {
            config,
            state: AtomicU32::new(SPACE_STATE_RUNNING),
            global_mutex: Mutex::new(()),
            stop_the_world: Condvar::new(),
            restart_the_world: Condvar::new(),
            gc_wakeup: Condvar::new(),
            gc_started: AtomicBool::new(false),
            gc_lock: SpinLock::new(),
            free_cells: UnsafeCell::new(std::ptr::null_mut()),
            dirty_segments: UnsafeCell::new(std::ptr::null_mut()),
            allocated_blocks: UnsafeCell::new(Vec::new()),
            free_cells_count: AtomicI64::new(0),
            heap_size: AtomicUsize::new(0),
            threads_lock: SpinLock::new(),
            threads: AtomicPtr::new(std::ptr::null_mut()),
            tuple_root: AtomicPtr::new(std::ptr::null_mut()),
            string_root: AtomicPtr::new(std::ptr::null_mut()),
            mutable_root: AtomicPtr::new(std::ptr::null_mut()),
            prototypes: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            gc_thread: UnsafeCell::new(None),
            bootstrap_context: UnsafeCell::new(std::ptr::null_mut()),
        });

        let space_ptr: *const Space = &*space;

        // Bootstrap context: owned by the Space, never handed to the
        // collector, so everything allocated here is immortal.
        let ctx = Box::into_raw(Box::new(Context::bootstrap(space_ptr)));
        unsafe {
            *space.bootstrap_context.get() = ctx;
            let ctx = &mut *ctx;

            space
                .threads
                .store(ProtoSparseMap::new(ctx).cell(), Ordering::Release);
            space
                .mutable_root
                .store(ProtoSparseMap::new(ctx).cell(), Ordering::Release);
            space
                .string_root
                .store(ProtoSparseMap::new(ctx).cell(), Ordering::Release);
            *space.prototypes.get() = Prototypes::bootstrap(ctx);
        }

        // Start the collector and wait until it reports in.
        let collector_space = SpacePointer(space_ptr);
        let handle = std::thread::Builder::new()
            .name("proto-gc".into())
            .spawn(move || crate::gc::collector_loop(collector_space))
            .unwrap_or_else(|e| {
                eprintln!("PANIC ERROR: cannot start the collector thread: {e}! Exiting ...");
                std::process::abort();
            });
        unsafe { *space.gc_thread.get() = Some(handle) };

        while !space.gc_started.load(Ordering::Acquire) {
            let guard = space.global_mutex.lock().unwrap_or_else(|e| e.into_inner());
            let _ = space
                .gc_wakeup
                .wait_timeout(guard, std::time::Duration::from_millis(100));
        }

        space
    }

    /// Current handshake state.
    #[inline(always)]
    pub(crate) fn space_state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_space_state(&self, state: u32) {
        self.state.store(state, Ordering::Release);
    }

    // =========================================================================
    // Free list and block allocation
    // =========================================================================

    /// Refill the global free list from the OS. Caller holds `gc_lock`.
    ///
    /// Enforces the heap cap: abort when `block_on_no_memory` is off,
    /// otherwise report failure so the caller can block on the collector.
    unsafe fn grow_heap_locked(&self) -> bool {
        let bytes = std::mem::size_of::<Cell>() * self.config.blocks_per_malloc_request;
        let heap = self.heap_size.load(Ordering::Relaxed);

        if self.config.max_heap_size != 0 && heap + bytes >= self.config.max_heap_size {
            if self.config.block_on_no_memory {
                return false;
            }
            eprintln!(
                "PANIC ERROR: HEAP size will be bigger than configured maximum ({} is over {} bytes)! Exiting ...",
                heap + bytes,
                self.config.max_heap_size
            );
            std::process::abort();
        }

        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page = if page > 0 { page as usize } else { 4096 };
        let mut block: *mut libc::c_void = std::ptr::null_mut();
        let rc = unsafe { libc::posix_memalign(&mut block, page, bytes) };
        if rc != 0 || block.is_null() {
            eprintln!("PANIC ERROR: Not enough MEMORY! Exiting ...");
            std::process::abort();
        }
        unsafe { libc::memset(block, 0, bytes) };

        // Chain the fresh cells onto the free list.
        let cells = block as *mut Cell;
        let n = bytes / std::mem::size_of::<Cell>();
        unsafe {
            let free = self.free_cells.get();
            for i in 0..n {
                let cell = cells.add(i);
                (*cell).next_cell = *free;
                *free = cell;
            }
            (*self.allocated_blocks.get()).push(block);
        }

        let total = heap + bytes;
        self.heap_size.store(total, Ordering::Relaxed);
        PEAK_HEAP_BYTES.fetch_max(total, Ordering::Relaxed);
        self.free_cells_count.fetch_add(n as i64, Ordering::Relaxed);
        true
    }

    /// Pop up to `want` cells from the global free list as a chain, growing
    /// the heap as needed. Returns null only when the heap cap is reached in
    /// blocking mode.
    fn pop_free_cells(&self, want: usize) -> *mut Cell {
        let _guard = self.gc_lock.lock();
        let mut head: *mut Cell = std::ptr::null_mut();
        let mut taken = 0usize;
        unsafe {
            let free = self.free_cells.get();
            for _ in 0..want {
                if (*free).is_null() && !self.grow_heap_locked() {
                    break;
                }
                let cell = *free;
                *free = (*cell).next_cell;
                (*cell).next_cell = head;
                head = cell;
                taken += 1;
            }
        }
        self.free_cells_count.fetch_sub(taken as i64, Ordering::Relaxed);
        TOTAL_CELLS_ALLOCATED.fetch_add(taken as u64, Ordering::Relaxed);
        head
    }

    /// Pull a thread-local pool refill from the global free list; in
    /// blocking mode, waits on the collector to return cells.
    pub(crate) fn get_free_cells(&self, thread: *mut Cell) -> *mut Cell {
        loop {
            let chain = self.pop_free_cells(self.config.blocks_per_allocation);
            if !chain.is_null() {
                return chain;
            }
            // Heap cap reached with blocking enabled: let a collection
            // reclaim cells, then retry.
            if !thread.is_null() {
                crate::thread::sync_to_gc(self, thread);
            }
            self.trigger_gc();
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    }

    /// One cell straight from the global free list, for frames with no
    /// owning thread (bootstrap and collector contexts).
    pub(crate) fn alloc_unpooled_cell(&self) -> *mut Cell {
        loop {
            let cell = self.pop_free_cells(1);
            if !cell.is_null() {
                unsafe { (*cell).next_cell = std::ptr::null_mut() };
                return cell;
            }
            self.trigger_gc();
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    }

    /// Return swept cells to the global free list.
    pub(crate) fn push_free_cells(&self, head: *mut Cell, tail: *mut Cell, count: usize) {
        if head.is_null() {
            return;
        }
        let _guard = self.gc_lock.lock();
        unsafe {
            let free = self.free_cells.get();
            (*tail).next_cell = *free;
            *free = head;
        }
        self.free_cells_count.fetch_add(count as i64, Ordering::Relaxed);
    }

    // =========================================================================
    // Dirty segments
    // =========================================================================

    /// Queue a frame's allocation chain for the next collection.
    pub(crate) fn analyze_used_cells(&self, chain: *mut Cell) {
        if chain.is_null() {
            return;
        }
        let _guard = self.gc_lock.lock();
        unsafe {
            let segments = self.dirty_segments.get();
            let segment = Box::into_raw(Box::new(DirtySegment {
                head: chain,
                next: *segments,
            }));
            *segments = segment;
        }
    }

    /// Detach the whole dirty-segment queue for analysis.
    pub(crate) fn take_dirty_segments(&self) -> *mut DirtySegment {
        let _guard = self.gc_lock.lock();
        unsafe {
            let segments = self.dirty_segments.get();
            let taken = *segments;
            *segments = std::ptr::null_mut();
            taken
        }
    }

    pub(crate) fn has_dirty_segments(&self) -> bool {
        let _guard = self.gc_lock.lock();
        unsafe { !(*self.dirty_segments.get()).is_null() }
    }

    /// Wake the collector.
    pub fn trigger_gc(&self) {
        self.gc_wakeup.notify_all();
    }

    // =========================================================================
    // Thread registry
    // =========================================================================

    /// Register a thread cell under the hash of its name.
    pub(crate) fn register_thread(&self, ctx: &mut Context, name_hash: u64, thread_value: Value) {
        let _guard = self.threads_lock.lock();
        let registry = ProtoSparseMap::from_cell(self.threads.load(Ordering::Acquire));
        let updated = registry.set_at(ctx, name_hash, thread_value);
        self.threads.store(updated.cell(), Ordering::Release);
    }

    /// Remove a thread cell from the registry.
    pub(crate) fn deregister_thread(&self, ctx: &mut Context, name_hash: u64) {
        let _guard = self.threads_lock.lock();
        let registry = ProtoSparseMap::from_cell(self.threads.load(Ordering::Acquire));
        let updated = registry.remove_at(ctx, name_hash);
        self.threads.store(updated.cell(), Ordering::Release);
    }

    /// The registered threads, as a persistent snapshot.
    pub(crate) fn thread_registry(&self) -> ProtoSparseMap {
        ProtoSparseMap::from_cell(self.threads.load(Ordering::Acquire))
    }

    // =========================================================================
    // Prototype table
    // =========================================================================

    pub(crate) fn prototypes(&self) -> &Prototypes {
        unsafe { &*self.prototypes.get() }
    }

    /// The prototype object backing any value, by pointer tag and embedded
    /// type.
    pub fn get_prototype(&self, v: Value) -> Value {
        let p = self.prototypes();
        if v.is_none() {
            return p.none;
        }
        match v.tag() {
            t if t == PointerTag::Embedded as u8 => match v.embedded_type() {
                e if e == EmbeddedType::SmallInt as u8 => p.small_int,
                e if e == EmbeddedType::Float as u8 => p.float,
                e if e == EmbeddedType::UnicodeChar as u8 => p.unicode_char,
                e if e == EmbeddedType::Boolean as u8 => p.boolean,
                e if e == EmbeddedType::Byte as u8 => p.byte,
                e if e == EmbeddedType::Date as u8 => p.date,
                e if e == EmbeddedType::Timestamp as u8 => p.timestamp,
                e if e == EmbeddedType::TimeDelta as u8 => p.timedelta,
                _ => Value::NONE,
            },
            t if t == PointerTag::Object as u8 => p.object,
            t if t == PointerTag::List as u8 => p.list,
            t if t == PointerTag::ListIterator as u8 => p.list_iterator,
            t if t == PointerTag::Tuple as u8 => p.tuple,
            t if t == PointerTag::TupleIterator as u8 => p.tuple_iterator,
            t if t == PointerTag::String as u8 => p.string,
            t if t == PointerTag::StringIterator as u8 => p.string_iterator,
            t if t == PointerTag::SparseMap as u8 => p.sparse_map,
            t if t == PointerTag::SparseMapIterator as u8 => p.sparse_map_iterator,
            t if t == PointerTag::ByteBuffer as u8 => p.byte_buffer,
            t if t == PointerTag::ExternalPointer as u8 => p.external_pointer,
            t if t == PointerTag::Method as u8 => p.method,
            t if t == PointerTag::Thread as u8 => p.thread,
            _ => Value::NONE,
        }
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        // Stop the collector.
        self.set_space_state(SPACE_STATE_ENDING);
        self.gc_wakeup.notify_all();
        if let Some(handle) = unsafe { (*self.gc_thread.get()).take() } {
            let _ = handle.join();
        }

        unsafe {
            // Drop the bootstrap context (its chain is immortal, nothing to
            // hand over).
            let ctx = *self.bootstrap_context.get();
            if !ctx.is_null() {
                drop(Box::from_raw(ctx));
            }

            // Free the dirty-segment records.
            let mut segment = *self.dirty_segments.get();
            while !segment.is_null() {
                let next = (*segment).next;
                drop(Box::from_raw(segment));
                segment = next;
            }

            // Return every heap block to the OS.
            for block in (*self.allocated_blocks.get()).drain(..) {
                libc::free(block);
            }
        }
    }
}

/// Send-wrapper handing the Space pointer to the collector thread. The
/// Space joins the collector before it is dropped.
pub(crate) struct SpacePointer(pub(crate) *const Space);
unsafe impl Send for SpacePointer {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_config_defaults() {
        let config = SpaceConfig::default();
        assert_eq!(config.max_allocated_cells_per_context, 1024);
        assert_eq!(config.blocks_per_allocation, 1024);
        assert_eq!(config.blocks_per_malloc_request, 8192);
        assert_eq!(config.max_heap_size, 512 * 1024 * 1024);
        assert!(!config.block_on_no_memory);
        assert_eq!(config.gc_sleep_milliseconds, 1000);
    }

    #[test]
    fn test_space_bootstraps_roots() {
        let space = Space::new(SpaceConfig::default());
        assert!(!space.threads.load(Ordering::Acquire).is_null());
        assert!(!space.mutable_root.load(Ordering::Acquire).is_null());
        assert!(!space.string_root.load(Ordering::Acquire).is_null());
        // The interning dictionary starts empty.
        assert!(space.tuple_root.load(Ordering::Acquire).is_null());
        assert!(space.gc_started.load(Ordering::Acquire));
    }

    #[test]
    fn test_free_list_pop_and_push() {
        let space = Space::new(SpaceConfig::default());
        let chain = space.pop_free_cells(3);
        assert!(!chain.is_null());
        let mut count = 0;
        let mut tail = chain;
        let mut cell = chain;
        while !cell.is_null() {
            count += 1;
            tail = cell;
            cell = unsafe { (*cell).next_cell };
        }
        assert_eq!(count, 3);
        space.push_free_cells(chain, tail, 3);
    }

    #[test]
    fn test_prototype_table_covers_every_tag() {
        let space = Space::new(SpaceConfig::default());
        let p = space.prototypes();
        assert_eq!(space.get_prototype(Value::from_small_int(1)), p.small_int);
        assert_eq!(space.get_prototype(Value::from_float(1.0)), p.float);
        assert_eq!(space.get_prototype(Value::TRUE), p.boolean);
        assert_eq!(space.get_prototype(Value::from_byte(1)), p.byte);
        assert_eq!(space.get_prototype(Value::from_date(2024, 1, 1)), p.date);
        assert_eq!(space.get_prototype(Value::from_timestamp(1)), p.timestamp);
        assert_eq!(space.get_prototype(Value::from_timedelta(-1)), p.timedelta);
        assert_eq!(space.get_prototype(Value::from_char(65)), p.unicode_char);
        assert_eq!(space.get_prototype(Value::NONE), p.none);
        // Prototype objects themselves are plain objects.
        assert_eq!(space.get_prototype(p.object), p.object);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        // SAFETY: serialized test-local env mutation.
        unsafe {
            std::env::set_var("PROTO_GC_SLEEP_MILLISECONDS", "25");
            std::env::set_var("PROTO_BLOCK_ON_NO_MEMORY", "true");
        }
        let config = SpaceConfig::from_env();
        assert_eq!(config.gc_sleep_milliseconds, 25);
        assert!(config.block_on_no_memory);
        unsafe {
            std::env::remove_var("PROTO_GC_SLEEP_MILLISECONDS");
            std::env::remove_var("PROTO_BLOCK_ON_NO_MEMORY");
        }
    }
}
