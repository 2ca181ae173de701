/// Integration tests for lookup internals: argument map canonicalization
/// and calls that straddle stack piece boundaries.

use umbra::alloc;
use umbra::bytecode::{self, Assembler};
use umbra::core::tagged::nothing;
use umbra::method::{self, GuardType};
use umbra::objects::{self, OperationType};
use umbra::{Runtime, RuntimeConfig, Value};

fn new_runtime() -> Runtime {
    let config = RuntimeConfig { semispace_size_bytes: 4 * 1024 * 1024, ..Default::default() };
    Runtime::new(config).expect("runtime should initialize")
}

// ─── Argument map canonicalization (P4) ───────────────────────────────────────

#[test]
fn test_equal_offset_sequences_share_one_array() {
    let mut rt = new_runtime();
    let (heap, roots) = rt.heap_and_roots();
    let first = method::canonicalize_argument_map(heap, roots, &[2, 1, 0]).unwrap();
    let second = method::canonicalize_argument_map(heap, roots, &[2, 1, 0]).unwrap();
    assert_eq!(first, second, "identical sequences must be pointer-equal");
    assert_eq!(objects::get_array_length(first), 3);
    assert_eq!(objects::get_array_at(first, 0).as_integer(), 2);
    assert_eq!(objects::get_array_at(first, 1).as_integer(), 1);
    assert_eq!(objects::get_array_at(first, 2).as_integer(), 0);
}

#[test]
fn test_distinct_offset_sequences_do_not_share() {
    let mut rt = new_runtime();
    let (heap, roots) = rt.heap_and_roots();
    let a = method::canonicalize_argument_map(heap, roots, &[2, 1, 0]).unwrap();
    let b = method::canonicalize_argument_map(heap, roots, &[1, 2, 0]).unwrap();
    let c = method::canonicalize_argument_map(heap, roots, &[2, 1]).unwrap();
    assert_ne!(a, b);
    assert_ne!(a, c);
    // Prefix paths share their trie spine but carry their own arrays.
    assert_eq!(objects::get_array_length(c), 2);
}

#[test]
fn test_two_lookups_return_the_identical_argument_map() {
    let mut rt = new_runtime();
    // Use the builtin integer + method through the lookup entry point twice.
    let plus = {
        let (heap, roots) = rt.heap_and_roots();
        let text = alloc::new_heap_utf8(heap, roots, "+").unwrap();
        alloc::new_heap_operation(heap, roots, OperationType::Infix, text).unwrap()
    };
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let (tags, values) = {
        let (heap, roots) = rt.heap_and_roots();
        let raw = alloc::new_heap_array_with(
            heap,
            roots,
            &[subject_key, selector_key, Value::new_integer(0)],
        )
        .unwrap();
        let entries = method::build_call_tags_entries(heap, roots, raw).unwrap();
        let tags = alloc::new_heap_call_tags(heap, roots, entries).unwrap();
        // Values in evaluation order are stored at their stack offsets.
        let values = alloc::new_heap_array(heap, roots, 3).unwrap();
        objects::set_array_at(values, 2, Value::new_integer(5));
        objects::set_array_at(values, 1, plus);
        objects::set_array_at(values, 0, Value::new_integer(3));
        (tags, values)
    };
    let ambience = rt.new_ambience().unwrap();
    let (heap, roots) = rt.heap_and_roots();
    let call_data = alloc::new_heap_call_data(heap, roots, tags, values).unwrap();
    let input = method::SigmapInput::CallData { call_data };
    let (method_a, map_a) =
        method::lookup_method_full(heap, roots, &input, ambience, nothing()).unwrap();
    let (method_b, map_b) =
        method::lookup_method_full(heap, roots, &input, ambience, nothing()).unwrap();
    assert_eq!(method_a, method_b);
    assert_eq!(map_a, map_b, "both lookups must intern to one argument map");
}

// ─── Guard scoring ────────────────────────────────────────────────────────────

#[test]
fn test_eq_guard_beats_is_guard() {
    let mut rt = new_runtime();
    let (heap, roots) = rt.heap_and_roots();
    let space = roots.builtin_methodspace();
    let five = Value::new_integer(5);
    let eq_guard = alloc::new_heap_guard(heap, roots, GuardType::Eq, five).unwrap();
    let integer_type = roots.builtin_type_for_immediate(five);
    let is_guard = alloc::new_heap_guard(heap, roots, GuardType::Is, integer_type).unwrap();
    let eq_score = method::guard_match(eq_guard, five, roots, space).unwrap();
    let is_score = method::guard_match(is_guard, five, roots, space).unwrap();
    assert!(umbra::core::tagged::is_score_better(eq_score, is_score));
    // A non-matching eq guard produces the no-match score.
    let miss = method::guard_match(eq_guard, Value::new_integer(6), roots, space).unwrap();
    assert!(!umbra::core::tagged::is_score_match(miss));
}

// ─── Stack piece transparency (P6) ────────────────────────────────────────────

/// Registers `subject.pass(x) = x` whose frame demands more slots than the
/// default piece has, forcing the call onto a fresh stack piece.
fn register_wide_method(rt: &mut Runtime, op: Value, high_water_mark: usize) {
    let mut body = Assembler::new();
    body.emit_load_argument(2);
    body.emit_return();
    let code = {
        let (heap, roots) = rt.heap_and_roots();
        body.flush(heap, roots).unwrap()
    };
    bytecode::set_code_block_high_water_mark(code, high_water_mark);
    let space = rt.roots.builtin_methodspace();
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let (heap, roots) = rt.heap_and_roots();
    let any_guard = alloc::new_heap_guard(heap, roots, GuardType::Any, nothing()).unwrap();
    let eq_guard = alloc::new_heap_guard(heap, roots, GuardType::Eq, op).unwrap();
    let tags = alloc::new_heap_array(heap, roots, 6).unwrap();
    let mut put = |i: usize, tag: Value, guard: Value, index: usize| {
        let tag_array = alloc::new_heap_array_with(heap, roots, &[tag]).unwrap();
        let param = alloc::new_heap_parameter(heap, roots, guard, tag_array, false, index).unwrap();
        objects::set_pair_array_first_at(tags, i, tag);
        objects::set_pair_array_second_at(tags, i, param);
    };
    put(0, subject_key, any_guard, 0);
    put(1, selector_key, eq_guard, 1);
    put(2, Value::new_integer(0), any_guard, 2);
    objects::co_sort_pair_array(tags);
    let signature = alloc::new_heap_signature(heap, roots, tags, 3, 3, false).unwrap();
    let m = alloc::new_heap_method(heap, roots, signature, code, nothing(), nothing(), 0).unwrap();
    method::add_methodspace_method(heap, roots, space, m).unwrap();
}

fn run_pass_call(rt: &mut Runtime, op: Value, argument: i64) -> Value {
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
    assm.emit_push(Value::new_integer(7));
    assm.emit_push(op);
    assm.emit_push(Value::new_integer(argument));
    assm.emit_invoke(tags, nothing());
    assm.emit_slap(3);
    assm.emit_return();
    let code = {
        let (heap, roots) = rt.heap_and_roots();
        assm.flush(heap, roots).unwrap()
    };
    let ambience = rt.new_ambience().unwrap();
    umbra::run_code_block(rt, ambience, code).expect("the call should complete")
}

#[test]
fn test_call_across_stack_piece_boundary_is_transparent() {
    // Within one piece.
    let mut rt = new_runtime();
    let narrow_op = {
        let (heap, roots) = rt.heap_and_roots();
        let text = alloc::new_heap_utf8(heap, roots, "pass").unwrap();
        alloc::new_heap_operation(heap, roots, OperationType::Infix, text).unwrap()
    };
    register_wide_method(&mut rt, narrow_op, 4);
    let small = run_pass_call(&mut rt, narrow_op, 99);

    // Across a piece boundary: the frame demands more slots than the whole
    // default piece, so the arguments transfer onto a fresh piece and the
    // return crosses back.
    let mut rt = new_runtime();
    let wide_op = {
        let (heap, roots) = rt.heap_and_roots();
        let text = alloc::new_heap_utf8(heap, roots, "pass").unwrap();
        alloc::new_heap_operation(heap, roots, OperationType::Infix, text).unwrap()
    };
    register_wide_method(&mut rt, wide_op, 2000);
    let large = run_pass_call(&mut rt, wide_op, 99);

    assert_eq!(small.as_integer(), 99);
    assert_eq!(large.as_integer(), 99, "a straddling call must behave identically");
}

#[test]
fn test_repeated_cross_piece_calls_reuse_the_stack() {
    let mut rt = new_runtime();
    let op = {
        let (heap, roots) = rt.heap_and_roots();
        let text = alloc::new_heap_utf8(heap, roots, "pass").unwrap();
        alloc::new_heap_operation(heap, roots, OperationType::Infix, text).unwrap()
    };
    register_wide_method(&mut rt, op, 2000);
    for i in 0..5 {
        let result = run_pass_call(&mut rt, op, i);
        assert_eq!(result.as_integer(), i);
    }
}

// ─── Ambiguity ────────────────────────────────────────────────────────────────

#[test]
fn test_ambiguous_overloads_fail_lookup() {
    // Two methods, each strictly better on a different argument: an eq on
    // the first positional with any on the second, and vice versa.
    let mut rt = new_runtime();
    let op = {
        let (heap, roots) = rt.heap_and_roots();
        let text = alloc::new_heap_utf8(heap, roots, "amb").unwrap();
        alloc::new_heap_operation(heap, roots, OperationType::Infix, text).unwrap()
    };
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let space = rt.roots.builtin_methodspace();

    let mut add = |rt: &mut Runtime, first_eq: bool| {
        let mut body = Assembler::new();
        body.emit_push(Value::new_integer(if first_eq { 1 } else { 2 }));
        body.emit_return();
        let code = {
            let (heap, roots) = rt.heap_and_roots();
            body.flush(heap, roots).unwrap()
        };
        let (heap, roots) = rt.heap_and_roots();
        let any_guard = alloc::new_heap_guard(heap, roots, GuardType::Any, nothing()).unwrap();
        let eq_one =
            alloc::new_heap_guard(heap, roots, GuardType::Eq, Value::new_integer(1)).unwrap();
        let eq_two =
            alloc::new_heap_guard(heap, roots, GuardType::Eq, Value::new_integer(2)).unwrap();
        let selector_guard = alloc::new_heap_guard(heap, roots, GuardType::Eq, op).unwrap();
        let tags = alloc::new_heap_array(heap, roots, 8).unwrap();
        let mut put = |i: usize, tag: Value, guard: Value, index: usize| {
            let tag_array = alloc::new_heap_array_with(heap, roots, &[tag]).unwrap();
            let param =
                alloc::new_heap_parameter(heap, roots, guard, tag_array, false, index).unwrap();
            objects::set_pair_array_first_at(tags, i, tag);
            objects::set_pair_array_second_at(tags, i, param);
        };
        put(0, subject_key, any_guard, 0);
        put(1, selector_key, selector_guard, 1);
        if first_eq {
            put(2, Value::new_integer(0), eq_one, 2);
            put(3, Value::new_integer(1), any_guard, 3);
        } else {
            put(2, Value::new_integer(0), any_guard, 2);
            put(3, Value::new_integer(1), eq_two, 3);
        }
        objects::co_sort_pair_array(tags);
        let signature = alloc::new_heap_signature(heap, roots, tags, 4, 4, false).unwrap();
        let m =
            alloc::new_heap_method(heap, roots, signature, code, nothing(), nothing(), 0).unwrap();
        method::add_methodspace_method(heap, roots, space, m).unwrap();
    };
    add(&mut rt, true);
    add(&mut rt, false);

    let tags = {
        let (heap, roots) = rt.heap_and_roots();
        let raw = alloc::new_heap_array_with(
            heap,
            roots,
            &[subject_key, selector_key, Value::new_integer(0), Value::new_integer(1)],
        )
        .unwrap();
        let entries = method::build_call_tags_entries(heap, roots, raw).unwrap();
        alloc::new_heap_call_tags(heap, roots, entries).unwrap()
    };
    let mut assm = Assembler::new();
    assm.emit_push(Value::new_integer(0));
    assm.emit_push(op);
    assm.emit_push(Value::new_integer(1));
    assm.emit_push(Value::new_integer(2));
    assm.emit_invoke(tags, nothing());
    assm.emit_slap(4);
    assm.emit_return();
    let code = {
        let (heap, roots) = rt.heap_and_roots();
        assm.flush(heap, roots).unwrap()
    };
    let ambience = rt.new_ambience().unwrap();
    let result = umbra::run_code_block(&mut rt, ambience, code);
    match result {
        Err(c) => {
            assert_eq!(c.cause(), umbra::ConditionCause::LookupError);
            assert_eq!(
                c.lookup_error_kind(),
                umbra::core::value::LookupErrorKind::Ambiguity
            );
        }
        Ok(v) => panic!("ambiguous call should not resolve, got {:?}", v),
    }
}
