//! The Collector
//!
//! A dedicated thread that periodically drains the dirty-segment queue,
//! requests a stop-the-world safepoint, snapshots the roots, marks, and
//! sweeps unreferenced cells back onto the global free list.
//!
//! The handshake walks four space states (`RUNNING -> STOPPING_WORLD ->
//! WORLD_TO_STOP -> WORLD_STOPPED -> RUNNING`) over one mutex and three
//! condition variables. Threads parked in the unmanaged state are not
//! waited on; their roots are pinned like everyone else's.
//!
//! Root snapshotting happens synchronously while the world is stopped; the
//! deep mark and the sweep run after the world restarts. That is sound
//! because dirty segments were detached before the handshake: cells
//! allocated after the snapshot live in current frame chains or newer
//! segments, never in the batch being swept.
//!
//! The live set is a persistent sparse map keyed by cell address hash,
//! built out of runtime cells themselves; the collector's own frame is
//! handed back as a dirty segment so dead live-set nodes are reclaimed by
//! the next cycle.

use crate::cell::{Cell, CellBody, cell_value, finalize, for_each_reference};
use crate::context::Context;
use crate::space::{
    SPACE_STATE_ENDING, SPACE_STATE_RUNNING, SPACE_STATE_STOPPING_WORLD,
    SPACE_STATE_WORLD_STOPPED, SPACE_STATE_WORLD_TO_STOP, Space, SpacePointer,
};
use crate::sparse::ProtoSparseMap;
use crate::thread::{THREAD_STATE_MANAGED, THREAD_STATE_STOPPING};
use proto_core::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// Process-lifetime counters for the at-exit report.
pub(crate) static TOTAL_GC_CYCLES: AtomicU64 = AtomicU64::new(0);
pub(crate) static TOTAL_CELLS_SWEPT: AtomicU64 = AtomicU64::new(0);

/// Collector thread body: sleep, drain, repeat until the Space ends.
pub(crate) fn collector_loop(space: SpacePointer) {
    let space = unsafe { &*space.0 };

    space.gc_started.store(true, Ordering::Release);
    space.gc_wakeup.notify_all();

    loop {
        {
            let guard = space
                .global_mutex
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let _ = space.gc_wakeup.wait_timeout(
                guard,
                Duration::from_millis(space.config.gc_sleep_milliseconds),
            );
        }
        if space.space_state() == SPACE_STATE_ENDING {
            break;
        }
        if space.has_dirty_segments() {
            collect(space);
        }
    }
}

/// One full collection: drain segments, stop the world, snapshot roots,
/// restart the world, mark, sweep.
fn collect(space: &Space) {
    TOTAL_GC_CYCLES.fetch_add(1, Ordering::Relaxed);

    // Detach the batch to analyze before anything else; cells flushed from
    // here on belong to the next cycle.
    let to_analyze = space.take_dirty_segments();
    if to_analyze.is_null() {
        return;
    }

    let mut gc_ctx = Context::bootstrap(space);
    let seeds = stop_the_world_and_snapshot(space);
    let live = mark(space, &mut gc_ctx, seeds);
    sweep(space, to_analyze, live);

    // Hand the collector's own allocations (the live set) to the next
    // cycle.
    space.analyze_used_cells(gc_ctx.last_allocated_cell);
    gc_ctx.last_allocated_cell = std::ptr::null_mut();
    gc_ctx.allocated_cells_count = 0;
}

/// Drive the handshake to WORLD_STOPPED, snapshot every root while no
/// managed thread is running, then release the world.
fn stop_the_world_and_snapshot(space: &Space) -> Vec<*mut Cell> {
    let mut guard = space
        .global_mutex
        .lock()
        .unwrap_or_else(|e| e.into_inner());

    // Ask every managed thread to stop at its next safepoint.
    space.set_space_state(SPACE_STATE_STOPPING_WORLD);

    loop {
        let mut any_managed = false;
        space.thread_registry().process_values(&mut |v| {
            let thread = v.cell_address() as *mut Cell;
            if crate::thread::thread_node(thread).state.load(Ordering::Acquire)
                == THREAD_STATE_MANAGED
            {
                any_managed = true;
            }
        });
        if !any_managed {
            break;
        }
        let (g, _) = space
            .stop_the_world
            .wait_timeout(guard, Duration::from_millis(10))
            .unwrap_or_else(|e| e.into_inner());
        guard = g;
    }

    // Everyone is at least STOPPING; let them fall through to STOPPED.
    space.set_space_state(SPACE_STATE_WORLD_TO_STOP);
    space.restart_the_world.notify_all();

    loop {
        let mut pending = false;
        space.thread_registry().process_values(&mut |v| {
            let thread = v.cell_address() as *mut Cell;
            let state = crate::thread::thread_node(thread).state.load(Ordering::Acquire);
            if state == THREAD_STATE_MANAGED || state == THREAD_STATE_STOPPING {
                pending = true;
            }
        });
        if !pending {
            break;
        }
        let (g, _) = space
            .stop_the_world
            .wait_timeout(guard, Duration::from_millis(10))
            .unwrap_or_else(|e| e.into_inner());
        guard = g;
    }

    space.set_space_state(SPACE_STATE_WORLD_STOPPED);

    // The world is stopped: every thread's context stack, locals, method
    // cache and free pool may be read safely. Collect the root seeds.
    let mut seeds: Vec<*mut Cell> = Vec::new();
    let mut seed_value = |v: Value| {
        if v.is_cell() && !v.is_none() {
            seeds.push(v.cell_address() as *mut Cell);
        }
    };

    seed_value(unsafe { maybe_cell_value(space.mutable_root.load(Ordering::Acquire)) });
    seed_value(unsafe { maybe_cell_value(space.string_root.load(Ordering::Acquire)) });
    seed_value(unsafe { maybe_cell_value(space.threads.load(Ordering::Acquire)) });
    seed_value(unsafe { maybe_cell_value(space.tuple_root.load(Ordering::Acquire)) });
    space.prototypes().for_each(&mut seed_value);

    let registry = space.thread_registry();
    registry.process_values(&mut |v| {
        let thread = v.cell_address() as *mut Cell;
        seeds.push(thread);
        // One hop out of the thread now, while its frames are stable; the
        // deep mark will not re-enter thread cells after the restart.
        unsafe { for_each_reference(thread, &mut |cell| seeds.push(cell)) };
    });

    // Free the world. Let them run.
    space.set_space_state(SPACE_STATE_RUNNING);
    space.restart_the_world.notify_all();
    drop(guard);

    seeds
}

unsafe fn maybe_cell_value(cell: *mut Cell) -> Value {
    if cell.is_null() {
        Value::NONE
    } else {
        unsafe { cell_value(cell) }
    }
}

/// Deep traversal from the seeds. The live set is itself a persistent
/// sparse map keyed by the 60-bit address hash.
fn mark(_space: &Space, gc_ctx: &mut Context, seeds: Vec<*mut Cell>) -> ProtoSparseMap {
    let mut live = ProtoSparseMap::new(gc_ctx);
    let mut stack = seeds;

    while let Some(cell) = stack.pop() {
        let hash = unsafe { (*cell).hash() };
        if live.has(hash) {
            continue;
        }
        live = live.set_at(gc_ctx, hash, unsafe { cell_value(cell) });

        // Thread frames mutate again now that the world is running; their
        // outgoing references were seeded during the stop.
        if matches!(unsafe { &(*cell).body }, CellBody::Thread(_)) {
            continue;
        }
        unsafe { for_each_reference(cell, &mut |referenced| stack.push(referenced)) };
    }
    live
}

/// Free every analyzed cell that the mark did not reach; re-queue the
/// survivors so a later collection can still reclaim them.
fn sweep(
    space: &Space,
    mut segment: *mut crate::space::DirtySegment,
    live: ProtoSparseMap,
) {
    let mut free_head: *mut Cell = std::ptr::null_mut();
    let mut free_tail: *mut Cell = std::ptr::null_mut();
    let mut freed = 0usize;

    let mut survivors: *mut Cell = std::ptr::null_mut();

    while !segment.is_null() {
        let mut cell = unsafe { (*segment).head };
        while !cell.is_null() {
            let next = unsafe { (*cell).next_cell };
            let hash = unsafe { (*cell).hash() };
            if live.has(hash) {
                unsafe {
                    (*cell).next_cell = survivors;
                }
                survivors = cell;
            } else {
                unsafe {
                    finalize(cell);
                    std::ptr::write_bytes(cell as *mut u8, 0, std::mem::size_of::<Cell>());
                    (*cell).next_cell = free_head;
                }
                if free_head.is_null() {
                    free_tail = cell;
                }
                free_head = cell;
                freed += 1;
            }
            cell = next;
        }
        let done = segment;
        segment = unsafe { (*segment).next };
        drop(unsafe { Box::from_raw(done) });
    }

    space.push_free_cells(free_head, free_tail, freed);
    TOTAL_CELLS_SWEPT.fetch_add(freed as u64, Ordering::Relaxed);

    // Survivors go back on the queue: when they die, a later cycle frees
    // them.
    space.analyze_used_cells(survivors);
}

// =============================================================================
// Tests
// =============================================================================
