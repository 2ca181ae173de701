/// Integration tests for collection: identity hashing across moves, map
/// rehashing, weak trackers, and allocation fuzzing resilience.

use umbra::alloc;
use umbra::bytecode::Assembler;
use umbra::core::tagged::{is_nothing, nothing};
use umbra::heap::tracker_flags;
use umbra::maps;
use umbra::method;
use umbra::objects::OperationType;
use umbra::species::{value_identity_compare, value_transient_identity_hash};
use umbra::{ConditionCause, Runtime, RuntimeConfig, Value};

fn new_runtime() -> Runtime {
    let config = RuntimeConfig { semispace_size_bytes: 4 * 1024 * 1024, ..Default::default() };
    Runtime::new(config).expect("runtime should initialize")
}

// ─── Hash / identity consistency (P2) ─────────────────────────────────────────

#[test]
fn test_equal_strings_hash_equal() {
    let mut rt = new_runtime();
    let (heap, roots) = rt.heap_and_roots();
    let a = alloc::new_heap_utf8(heap, roots, "stable").unwrap();
    let b = alloc::new_heap_utf8(heap, roots, "stable").unwrap();
    assert_ne!(a, b, "two allocations are distinct objects");
    assert!(value_identity_compare(a, b));
    assert_eq!(
        value_transient_identity_hash(a).unwrap(),
        value_transient_identity_hash(b).unwrap()
    );
}

#[test]
fn test_string_hash_stable_across_gc() {
    let mut rt = new_runtime();
    let s = {
        let (heap, roots) = rt.heap_and_roots();
        alloc::new_heap_utf8(heap, roots, "deep frozen").unwrap()
    };
    let handle = rt.protect(s);
    let before = value_transient_identity_hash(handle.deref()).unwrap();
    rt.garbage_collect().unwrap();
    let after = value_transient_identity_hash(handle.deref()).unwrap();
    assert_ne!(handle.deref(), s, "the string moved");
    assert_eq!(before, after, "content hashes survive relocation");
    rt.unprotect(handle);
}

#[test]
fn test_structural_array_hash() {
    let mut rt = new_runtime();
    let (heap, roots) = rt.heap_and_roots();
    let one = alloc::new_heap_utf8(heap, roots, "x").unwrap();
    let two = alloc::new_heap_utf8(heap, roots, "x").unwrap();
    let a = alloc::new_heap_array_with(heap, roots, &[one, Value::new_integer(2)]).unwrap();
    let b = alloc::new_heap_array_with(heap, roots, &[two, Value::new_integer(2)]).unwrap();
    assert!(value_identity_compare(a, b));
    assert_eq!(
        value_transient_identity_hash(a).unwrap(),
        value_transient_identity_hash(b).unwrap()
    );
}

// ─── Map rehash (P3, S2) ──────────────────────────────────────────────────────

#[test]
fn test_map_with_string_keys_survives_gc() {
    let mut rt = new_runtime();
    let map = {
        let (heap, roots) = rt.heap_and_roots();
        let map = alloc::new_heap_id_hash_map(heap, roots, 16).unwrap();
        for (name, value) in [("foo", 1), ("bar", 2), ("baz", 3)] {
            let key = alloc::new_heap_utf8(heap, roots, name).unwrap();
            maps::set_id_hash_map_at(heap, roots, map, key, Value::new_integer(value)).unwrap();
        }
        map
    };
    let handle = rt.protect(map);
    rt.garbage_collect().unwrap();
    let map = handle.deref();
    let (heap, roots) = rt.heap_and_roots();
    for (name, value) in [("foo", 1), ("bar", 2), ("baz", 3)] {
        let probe = alloc::new_heap_utf8(heap, roots, name).unwrap();
        let found = maps::get_id_hash_map_at(map, probe).unwrap();
        assert_eq!(found.as_integer(), value, "{} should survive collection", name);
    }
    rt.unprotect(handle);
}

#[test]
fn test_map_rehashes_address_keyed_entries() {
    // Reference keys hash by address, which changes when they move; without
    // the post-migration rehash these lookups would all go to stale slots.
    let mut rt = new_runtime();
    let (map, k1, k2, k3) = {
        let (heap, roots) = rt.heap_and_roots();
        let map = alloc::new_heap_id_hash_map(heap, roots, 16).unwrap();
        let k1 = alloc::new_heap_reference(heap, roots, nothing()).unwrap();
        let k2 = alloc::new_heap_reference(heap, roots, nothing()).unwrap();
        let k3 = alloc::new_heap_reference(heap, roots, nothing()).unwrap();
        maps::set_id_hash_map_at(heap, roots, map, k1, Value::new_integer(1)).unwrap();
        maps::set_id_hash_map_at(heap, roots, map, k2, Value::new_integer(2)).unwrap();
        maps::set_id_hash_map_at(heap, roots, map, k3, Value::new_integer(3)).unwrap();
        (map, k1, k2, k3)
    };
    let s_map = rt.protect(map);
    let s_k1 = rt.protect(k1);
    let s_k2 = rt.protect(k2);
    let s_k3 = rt.protect(k3);
    rt.garbage_collect().unwrap();
    assert_ne!(s_k1.deref(), k1, "keys moved");
    assert_eq!(maps::get_id_hash_map_at(s_map.deref(), s_k1.deref()).unwrap().as_integer(), 1);
    assert_eq!(maps::get_id_hash_map_at(s_map.deref(), s_k2.deref()).unwrap().as_integer(), 2);
    assert_eq!(maps::get_id_hash_map_at(s_map.deref(), s_k3.deref()).unwrap().as_integer(), 3);
    for handle in [s_map, s_k1, s_k2, s_k3] {
        rt.unprotect(handle);
    }
}

#[test]
fn test_map_deletion_leaves_other_entries_reachable() {
    let mut rt = new_runtime();
    let (heap, roots) = rt.heap_and_roots();
    let map = alloc::new_heap_id_hash_map(heap, roots, 16).unwrap();
    let keys: Vec<Value> = (0..8)
        .map(|_| alloc::new_heap_reference(heap, roots, nothing()).unwrap())
        .collect();
    for (i, &key) in keys.iter().enumerate() {
        maps::set_id_hash_map_at(heap, roots, map, key, Value::new_integer(i as i64)).unwrap();
    }
    maps::delete_id_hash_map_at(map, keys[3]).unwrap();
    assert_eq!(maps::get_id_hash_map_size(map), 7);
    assert!(maps::get_id_hash_map_at(map, keys[3]).is_err());
    for (i, &key) in keys.iter().enumerate() {
        if i != 3 {
            assert_eq!(maps::get_id_hash_map_at(map, key).unwrap().as_integer(), i as i64);
        }
    }
}

// ─── Trackers ─────────────────────────────────────────────────────────────────

#[test]
fn test_weak_tracker_clears_for_dead_referent() {
    let mut rt = new_runtime();
    let (heap, roots) = rt.heap_and_roots();
    let doomed = alloc::new_heap_reference(heap, roots, nothing()).unwrap();
    let weak = rt.heap.new_tracker(doomed, tracker_flags::ALWAYS_WEAK, None);
    rt.garbage_collect().unwrap();
    assert!(is_nothing(weak.deref()), "nothing kept the referent alive");
    rt.heap.dispose_tracker(weak);
}

#[test]
fn test_weak_tracker_follows_survivor() {
    let mut rt = new_runtime();
    let (heap, roots) = rt.heap_and_roots();
    let survivor = alloc::new_heap_reference(heap, roots, nothing()).unwrap();
    let strong = rt.protect(survivor);
    let weak = rt.heap.new_tracker(survivor, tracker_flags::ALWAYS_WEAK, None);
    rt.garbage_collect().unwrap();
    assert!(!is_nothing(weak.deref()));
    assert_eq!(weak.deref(), strong.deref(), "weak handle follows the move");
    rt.heap.dispose_tracker(weak);
    rt.unprotect(strong);
}

// ─── Heap validation ──────────────────────────────────────────────────────────

#[test]
fn test_heap_validates_after_collection() {
    let mut rt = new_runtime();
    {
        let (heap, roots) = rt.heap_and_roots();
        for i in 0..100 {
            let text = format!("value {}", i);
            alloc::new_heap_utf8(heap, roots, &text).unwrap();
        }
    }
    rt.validate_heap().unwrap();
    rt.garbage_collect().unwrap();
    rt.validate_heap().unwrap();
}

// ─── Fuzzing resilience (P8) ──────────────────────────────────────────────────

#[test]
fn test_interpreter_survives_allocation_fuzzing() {
    let config = RuntimeConfig {
        semispace_size_bytes: 512 * 1024,
        gc_fuzz_freq: 0, // armed below, after setup
        ..Default::default()
    };
    let mut rt = Runtime::new(config).unwrap();

    // Assemble 5 + 3 before arming the fuzzer so setup can't fail.
    let plus = {
        let (heap, roots) = rt.heap_and_roots();
        let text = alloc::new_heap_utf8(heap, roots, "+").unwrap();
        alloc::new_heap_operation(heap, roots, OperationType::Infix, text).unwrap()
    };
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let tags = {
        let (heap, roots) = rt.heap_and_roots();
        let raw = alloc::new_heap_array_with(
            heap,
            roots,
            &[subject_key, selector_key, Value::new_integer(0)],
        )
        .unwrap();
        let entries = method::build_call_tags_entries(heap, roots, raw).unwrap();
        alloc::new_heap_call_tags(heap, roots, entries).unwrap()
    };
    let mut assm = Assembler::new();
    assm.emit_push(Value::new_integer(5));
    assm.emit_push(plus);
    assm.emit_push(Value::new_integer(3));
    assm.emit_invoke(tags, nothing());
    assm.emit_slap(3);
    assm.emit_return();
    let code = {
        let (heap, roots) = rt.heap_and_roots();
        assm.flush(heap, roots).unwrap()
    };
    let ambience = rt.new_ambience().unwrap();
    let s_code = rt.protect(code);
    let s_ambience = rt.protect(ambience);

    rt.heap.config.gc_fuzz_freq = 7;
    rt.heap.enable_fuzzing();

    for _ in 0..40 {
        loop {
            match umbra::run_code_block(&mut rt, s_ambience.deref(), s_code.deref()) {
                Ok(result) => {
                    assert_eq!(result.as_integer(), 8);
                    break;
                }
                Err(c) if c.cause() == ConditionCause::HeapExhausted => {
                    rt.garbage_collect().unwrap();
                }
                Err(c) => panic!("unexpected condition: {:?}", c),
            }
        }
    }
    assert!(rt.gc_count > 0, "fuzzing should have forced collections");
    rt.unprotect(s_code);
    rt.unprotect(s_ambience);
}
