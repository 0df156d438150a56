//! End-to-end scenarios exercising a full Space: interning, prototype
//! chains, collection under load, threading and concurrent mutation.

use proto_runtime::{
    Context, ProtoList, ProtoObject, ProtoSparseMap, ProtoString, Space, SpaceConfig, Value, call,
};
use serial_test::serial;
use std::time::Duration;

fn quiet_config() -> SpaceConfig {
    SpaceConfig {
        gc_sleep_milliseconds: 10_000,
        ..SpaceConfig::default()
    }
}

#[test]
#[serial]
fn interning_across_collections_and_threads() {
    let space = Space::new(SpaceConfig {
        max_allocated_cells_per_context: 512,
        gc_sleep_milliseconds: 50,
        ..SpaceConfig::default()
    });
    let thread = space.adopt_current_thread("interning");
    let mut ctx = space.root_context(thread);

    {
        let mut frame = Context::frame(&mut ctx);

        let mut list1 = frame.new_list();
        list1 = list1.append_last(&mut frame, Value::from_small_int(1));
        list1 = list1.append_last(&mut frame, Value::from_small_int(2));
        let mut list2 = frame.new_list();
        list2 = list2.append_last(&mut frame, Value::from_small_int(1));
        list2 = list2.append_last(&mut frame, Value::from_small_int(2));

        let t1 = frame.new_tuple_from_list(list1);
        let t2 = frame.new_tuple_from_list(list2);
        assert_eq!(t1.as_value(), t2.as_value());

        let mut list3 = frame.new_list();
        list3 = list3.append_last(&mut frame, Value::from_small_int(1));
        list3 = list3.append_last(&mut frame, Value::from_small_int(3));
        let t3 = frame.new_tuple_from_list(list3);
        assert_ne!(t1.as_value(), t3.as_value());

        // Strings intern the same way, across a collection.
        let s1 = frame.from_utf8_string("proto runtime");
        thread.set_unmanaged();
        frame.space().trigger_gc();
        std::thread::sleep(Duration::from_millis(300));
        let space_ptr: *const Space = frame.space();
        thread.set_managed(unsafe { &*space_ptr });
        let s2 = frame.from_utf8_string("proto runtime");
        assert_eq!(s1.as_value(), s2.as_value());
    }

    space.release_current_thread(&mut ctx);
}

#[test]
#[serial]
fn prototype_shadowing_scenario() {
    let space = Space::new(quiet_config());
    let thread = space.adopt_current_thread("shadowing");
    let mut ctx = space.root_context(thread);

    {
        let mut frame = Context::frame(&mut ctx);
        let version = frame.from_utf8_string("version");

        let base = frame.new_object(false);
        let proto = base.set_attribute(&mut frame, version, Value::from_small_int(1));

        let child = proto.new_child(&mut frame, false);
        assert_eq!(child.get_attribute(&mut frame, version).as_small_int(), 1);
        assert!(!child.has_own_attribute(&mut frame, version).as_bool());

        let child2 = child.set_attribute(&mut frame, version, Value::from_small_int(2));
        assert_eq!(child.get_attribute(&mut frame, version).as_small_int(), 1);
        assert_eq!(child2.get_attribute(&mut frame, version).as_small_int(), 2);

        // Resolution agrees with the flattened attribute view.
        let flat = child2.get_attributes(&mut frame);
        assert_eq!(
            flat.get_at(version.get_hash()),
            child2.get_attribute(&mut frame, version)
        );
    }

    space.release_current_thread(&mut ctx);
}

#[test]
#[serial]
fn gc_retention_scenario() {
    let space = Space::new(SpaceConfig {
        max_allocated_cells_per_context: 512,
        gc_sleep_milliseconds: 50,
        ..SpaceConfig::default()
    });
    let thread = space.adopt_current_thread("retention");
    let mut ctx = space.root_context(thread);

    let mut locals = [Value::NONE; 1];
    {
        let mut frame = Context::frame_with_locals(&mut ctx, &mut locals);

        let mut root_list = frame.new_list();
        for i in 0..2_000i64 {
            let mut throwaway = frame.new_list();
            throwaway = throwaway.append_last(&mut frame, Value::from_small_int(i));
            if i % 100 == 0 {
                root_list = root_list.append_last(&mut frame, throwaway.as_value());
                frame.set_local(0, root_list.as_value());
            }
        }
        assert_eq!(root_list.get_size(), 20);

        thread.set_unmanaged();
        frame.space().trigger_gc();
        std::thread::sleep(Duration::from_millis(500));
        let space_ptr: *const Space = frame.space();
        thread.set_managed(unsafe { &*space_ptr });

        let first = ProtoList::from_value(root_list.get_at(0)).expect("first retained list");
        assert_eq!(first.get_at(0).as_small_int(), 0);
        let last = ProtoList::from_value(root_list.get_at(-1)).expect("last retained list");
        assert_eq!(last.get_at(0).as_small_int(), 1_900);
    }

    space.release_current_thread(&mut ctx);
}

#[test]
#[serial]
fn large_list_random_access_and_sum() {
    let space = Space::new(SpaceConfig {
        max_heap_size: 0,
        ..quiet_config()
    });
    let thread = space.adopt_current_thread("large-list");
    let mut ctx = space.root_context(thread);

    let mut locals = [Value::NONE; 1];
    {
        let mut frame = Context::frame_with_locals(&mut ctx, &mut locals);

        let mut list = frame.new_list();
        for i in 0..100_000i64 {
            list = list.append_last(&mut frame, Value::from_small_int(i));
            frame.set_local(0, list.as_value());
        }
        assert_eq!(list.get_size(), 100_000);

        // Scattered random access by index.
        let mut probe = 0x1234_5678u64;
        for _ in 0..1_000 {
            probe = probe.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let index = (probe % 100_000) as i64;
            assert_eq!(list.get_at(index).as_small_int(), index);
        }

        // In-order iteration sums to the closed form.
        let mut sum = 0i64;
        let mut iter = list.get_iterator(&mut frame);
        while iter.has_next() {
            sum += iter.next().as_small_int();
            iter = iter.advance(&mut frame);
        }
        assert_eq!(sum, 99_999i64 * 100_000 / 2);
    }

    space.release_current_thread(&mut ctx);
}

// Each worker stores one attribute on the shared mutable object: args are
// [object, name, value].
fn set_one_attribute(
    ctx: &mut Context,
    _self: Value,
    _parent: *mut proto_runtime::cell::Cell,
    args: ProtoList,
    _kwargs: ProtoSparseMap,
) -> Value {
    let object = ProtoObject::from_value(args.get_at(0));
    let name = ProtoString::from_value(args.get_at(1)).expect("attribute name");
    let value = args.get_at(2);
    for _ in 0..100 {
        object.set_attribute(ctx, name, value);
    }
    Value::NONE
}

#[test]
#[serial]
fn concurrent_mutable_writes_via_cas() {
    let space = Space::new(quiet_config());
    let thread = space.adopt_current_thread("cas-main");
    let mut ctx = space.root_context(thread);

    {
        let mut frame = Context::frame(&mut ctx);
        let shared = frame.new_object(true);
        assert_ne!(shared.mutable_ref(), 0);

        let alpha = frame.from_utf8_string("alpha");
        let beta = frame.from_utf8_string("beta");

        let mut args_a = frame.new_list();
        args_a = args_a.append_last(&mut frame, shared.as_value());
        args_a = args_a.append_last(&mut frame, alpha.as_value());
        args_a = args_a.append_last(&mut frame, Value::from_small_int(1));

        let mut args_b = frame.new_list();
        args_b = args_b.append_last(&mut frame, shared.as_value());
        args_b = args_b.append_last(&mut frame, beta.as_value());
        args_b = args_b.append_last(&mut frame, Value::from_small_int(2));

        let kwargs = frame.new_sparse_map();
        let name_a = frame.from_utf8_string("writer-a");
        let name_b = frame.from_utf8_string("writer-b");

        let space_ptr: *const Space = frame.space();
        let worker_a =
            unsafe { &*space_ptr }.new_thread(&mut frame, name_a, set_one_attribute, args_a, kwargs);
        let worker_b =
            unsafe { &*space_ptr }.new_thread(&mut frame, name_b, set_one_attribute, args_b, kwargs);
        worker_a.join(&mut frame);
        worker_b.join(&mut frame);

        // Both writes must be observable: the CAS publication loses neither.
        assert_eq!(shared.get_attribute(&mut frame, alpha).as_small_int(), 1);
        assert_eq!(shared.get_attribute(&mut frame, beta).as_small_int(), 2);
        let flat = shared.get_attributes(&mut frame);
        assert_eq!(flat.get_size(), 2);
    }

    space.release_current_thread(&mut ctx);
}

fn main_entry(
    ctx: &mut Context,
    _self: Value,
    _parent: *mut proto_runtime::cell::Cell,
    args: ProtoList,
    _kwargs: ProtoSparseMap,
) -> Value {
    // Positional convention: [argc, [argv...]].
    let argc = args.get_at(0).as_small_int();
    let argv = ProtoList::from_value(args.get_at(1)).expect("argv list");
    assert_eq!(argc, argv.get_size() as i64);
    let first = ProtoString::from_value(argv.get_at(0)).expect("argv[0]");
    assert_eq!(first.to_utf8_string(), "proto");

    // Exercise dispatch through the method cache from the main thread.
    let name = ctx.from_utf8_string("double");
    let method = ctx.from_method(double_first).as_value();
    let object = ctx.new_object(false).set_attribute(ctx, name, method);
    let mut call_args = ctx.new_list();
    call_args = call_args.append_last(ctx, Value::from_small_int(21));
    let kwargs = ctx.new_sparse_map();
    let result = call(ctx, object.as_value(), name, call_args, kwargs);
    assert_eq!(result.as_small_int(), 42);
    Value::NONE
}

fn double_first(
    _ctx: &mut Context,
    _self: Value,
    _parent: *mut proto_runtime::cell::Cell,
    args: ProtoList,
    _kwargs: ProtoSparseMap,
) -> Value {
    Value::from_small_int(args.get_at(0).as_small_int() * 2)
}

#[test]
#[serial]
fn space_run_end_to_end() {
    Space::run(quiet_config(), main_entry, &["proto", "--demo"]);
}
