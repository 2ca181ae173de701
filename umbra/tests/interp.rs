/// Integration tests for the interpreter core: dispatch, escapes, ensure
/// blocks, signals.
///
/// These tests assemble code blocks by hand the way the compiler would emit
/// them: arguments pushed in evaluation order, a Slap after every invoke to
/// drop them below the result, escape/handler destinations patched to the
/// join points once those are known.

use std::sync::Mutex;

use umbra::alloc;
use umbra::bytecode::Assembler;
use umbra::core::tagged::{is_nothing, nothing, null};
use umbra::intrinsics::{BuiltinArguments, BuiltinMethod};
use umbra::method::{self, GuardType};
use umbra::objects::OperationType;
use umbra::species::Mode;
use umbra::{Condition, ConditionCause, Runtime, RuntimeConfig, Value};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn new_runtime() -> Runtime {
    let config = RuntimeConfig { semispace_size_bytes: 4 * 1024 * 1024, ..Default::default() };
    Runtime::new(config).expect("runtime should initialize")
}

fn operation(rt: &mut Runtime, operation_type: OperationType, name: &str) -> Value {
    let (heap, roots) = rt.heap_and_roots();
    let text = alloc::new_heap_utf8(heap, roots, name).unwrap();
    alloc::new_heap_operation(heap, roots, operation_type, text).unwrap()
}

/// Builds call tags for tags given in evaluation order.
fn call_tags(rt: &mut Runtime, tags: &[Value]) -> Value {
    let (heap, roots) = rt.heap_and_roots();
    let raw = alloc::new_heap_array_with(heap, roots, tags).unwrap();
    let entries = method::build_call_tags_entries(heap, roots, raw).unwrap();
    alloc::new_heap_call_tags(heap, roots, entries).unwrap()
}

fn flush(rt: &mut Runtime, assm: &Assembler) -> Value {
    let (heap, roots) = rt.heap_and_roots();
    assm.flush(heap, roots).unwrap()
}

/// Registers a method `subject.op()` with an Is guard on the subject whose
/// body just returns a constant.
fn add_constant_method(rt: &mut Runtime, subject_type: Value, op: Value, result: Value) {
    let mut body = Assembler::new();
    body.emit_push(result);
    body.emit_return();
    let code = flush(rt, &body);
    add_method_with_code(rt, subject_type, op, code, 0);
}

fn add_method_with_code(
    rt: &mut Runtime,
    subject_type: Value,
    op: Value,
    code: Value,
    positional_count: usize,
) {
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let space = rt.roots.builtin_methodspace();
    let (heap, roots) = rt.heap_and_roots();
    let subject_guard = if is_nothing(subject_type) {
        alloc::new_heap_guard(heap, roots, GuardType::Any, nothing()).unwrap()
    } else {
        alloc::new_heap_guard(heap, roots, GuardType::Is, subject_type).unwrap()
    };
    let selector_guard = alloc::new_heap_guard(heap, roots, GuardType::Eq, op).unwrap();
    let any_guard = alloc::new_heap_guard(heap, roots, GuardType::Any, nothing()).unwrap();
    let param_count = 2 + positional_count;
    let tags = alloc::new_heap_array(heap, roots, param_count * 2).unwrap();
    let mut put = |i: usize, tag: Value, guard: Value, index: usize| {
        let tag_array = alloc::new_heap_array_with(heap, roots, &[tag]).unwrap();
        let param =
            alloc::new_heap_parameter(heap, roots, guard, tag_array, false, index).unwrap();
        umbra::objects::set_pair_array_first_at(tags, i, tag);
        umbra::objects::set_pair_array_second_at(tags, i, param);
    };
    put(0, subject_key, subject_guard, 0);
    put(1, selector_key, selector_guard, 1);
    for i in 0..positional_count {
        put(2 + i, Value::new_integer(i as i64), any_guard, 2 + i);
    }
    umbra::objects::co_sort_pair_array(tags);
    let signature =
        alloc::new_heap_signature(heap, roots, tags, param_count, param_count, false).unwrap();
    let m =
        alloc::new_heap_method(heap, roots, signature, code, nothing(), nothing(), 0).unwrap();
    method::add_methodspace_method(heap, roots, space, m).unwrap();
}

/// A fresh instance whose primary type is the given type value.
fn instance_of(rt: &mut Runtime, type_value: Value) -> Value {
    let (heap, roots) = rt.heap_and_roots();
    let derivatives = alloc::new_heap_array_buffer(heap, roots, 4).unwrap();
    let species = alloc::new_heap_instance_species(
        heap,
        roots,
        type_value,
        nothing(),
        Mode::Mutable,
        derivatives,
    )
    .unwrap();
    alloc::new_heap_instance(heap, roots, species).unwrap()
}

fn run(rt: &mut Runtime, code: Value) -> Result<Value, Condition> {
    let ambience = rt.new_ambience().unwrap();
    umbra::run_code_block(rt, ambience, code)
}

// ─── Integer arithmetic (S1) ──────────────────────────────────────────────────

#[test]
fn test_integer_addition() {
    let mut rt = new_runtime();
    let plus = operation(&mut rt, OperationType::Infix, "+");
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let tags = call_tags(&mut rt, &[subject_key, selector_key, Value::new_integer(0)]);

    let mut assm = Assembler::new();
    assm.emit_push(Value::new_integer(5));
    assm.emit_push(plus);
    assm.emit_push(Value::new_integer(3));
    assm.emit_invoke(tags, nothing());
    assm.emit_slap(3);
    assm.emit_return();
    let code = flush(&mut rt, &assm);

    let result = run(&mut rt, code).expect("5 + 3 should run");
    assert_eq!(result.as_integer(), 8);
}

#[test]
fn test_nested_arithmetic() {
    // (5 + 3) * 2
    let mut rt = new_runtime();
    let plus = operation(&mut rt, OperationType::Infix, "+");
    let times = operation(&mut rt, OperationType::Infix, "*");
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let tags = call_tags(&mut rt, &[subject_key, selector_key, Value::new_integer(0)]);

    let mut assm = Assembler::new();
    assm.emit_push(Value::new_integer(5));
    assm.emit_push(plus);
    assm.emit_push(Value::new_integer(3));
    assm.emit_invoke(tags, nothing());
    assm.emit_slap(3);
    assm.emit_push(times);
    assm.emit_push(Value::new_integer(2));
    assm.emit_invoke(tags, nothing());
    assm.emit_slap(3);
    assm.emit_return();
    let code = flush(&mut rt, &assm);

    let result = run(&mut rt, code).unwrap();
    assert_eq!(result.as_integer(), 16);
}

#[test]
fn test_lookup_failure_is_a_condition() {
    let mut rt = new_runtime();
    let bogus = operation(&mut rt, OperationType::Infix, "no_such_method");
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let tags = call_tags(&mut rt, &[subject_key, selector_key]);

    let mut assm = Assembler::new();
    assm.emit_push(Value::new_integer(5));
    assm.emit_push(bogus);
    assm.emit_invoke(tags, nothing());
    assm.emit_slap(2);
    assm.emit_return();
    let code = flush(&mut rt, &assm);

    let result = run(&mut rt, code);
    assert!(matches!(result, Err(c) if c.cause() == ConditionCause::LookupError));
}

// ─── Stack and reference opcodes ──────────────────────────────────────────────

#[test]
fn test_push_pop_slap_new_array() {
    let mut rt = new_runtime();
    let mut assm = Assembler::new();
    assm.emit_push(Value::new_integer(1));
    assm.emit_push(Value::new_integer(2));
    assm.emit_push(Value::new_integer(3));
    assm.emit_new_array(2);
    assm.emit_slap(1);
    assm.emit_return();
    let code = flush(&mut rt, &assm);
    let result = run(&mut rt, code).unwrap();
    assert!(umbra::species::in_family(umbra::Family::Array, result));
    assert_eq!(umbra::objects::get_array_length(result), 2);
    assert_eq!(umbra::objects::get_array_at(result, 0).as_integer(), 2);
    assert_eq!(umbra::objects::get_array_at(result, 1).as_integer(), 3);
}

#[test]
fn test_references_read_back_what_was_set() {
    let mut rt = new_runtime();
    let mut assm = Assembler::new();
    assm.emit_push(Value::new_integer(7));
    assm.emit_new_reference();
    // Stack: [ref]; write 9 through it, then read it back.
    assm.emit_push(Value::new_integer(9));
    assm.emit_load_local(0);
    assm.emit_set_reference();
    assm.emit_pop(1);
    assm.emit_get_reference();
    assm.emit_return();
    let code = flush(&mut rt, &assm);
    let result = run(&mut rt, code).unwrap();
    assert_eq!(result.as_integer(), 9);
}

// ─── Escapes (S3) ─────────────────────────────────────────────────────────────

const ESCAPE_SLOT: usize = 9;

#[test]
fn test_escape_returns_value() {
    let mut rt = new_runtime();
    let call = operation(&mut rt, OperationType::Call, "");
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let tags = call_tags(&mut rt, &[subject_key, selector_key, Value::new_integer(0)]);

    // with_escape e { e(17) }
    let mut assm = Assembler::new();
    let create_pc = assm.emit_create_escape(0);
    assm.emit_load_local(ESCAPE_SLOT);
    assm.emit_push(call);
    assm.emit_push(Value::new_integer(17));
    assm.emit_invoke(tags, nothing());
    assm.emit_slap(3);
    let join_pc = assm.pc();
    assm.emit_dispose_escape();
    assm.emit_return();
    assm.patch_operand(create_pc, 0, (join_pc - (create_pc + 2)) as u16);
    let code = flush(&mut rt, &assm);

    let result = run(&mut rt, code).expect("escape should deliver its value");
    assert_eq!(result.as_integer(), 17);
}

#[test]
fn test_escape_not_fired_takes_the_normal_path() {
    let mut rt = new_runtime();
    // with_escape e { 23 }: body never fires the escape.
    let mut assm = Assembler::new();
    let create_pc = assm.emit_create_escape(0);
    assm.emit_push(Value::new_integer(23));
    let join_pc = assm.pc();
    assm.emit_dispose_escape();
    assm.emit_return();
    assm.patch_operand(create_pc, 0, (join_pc - (create_pc + 2)) as u16);
    let code = flush(&mut rt, &assm);
    let result = run(&mut rt, code).unwrap();
    assert_eq!(result.as_integer(), 23);
}

// ─── Ensure (S4, P5) ──────────────────────────────────────────────────────────

static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

fn log_exit(_args: &mut BuiltinArguments) -> Result<Value, Condition> {
    LOG.lock().unwrap().push("exit");
    Ok(null())
}

fn log_inner(_args: &mut BuiltinArguments) -> Result<Value, Condition> {
    LOG.lock().unwrap().push("inner");
    Ok(null())
}

fn log_outer(_args: &mut BuiltinArguments) -> Result<Value, Condition> {
    LOG.lock().unwrap().push("outer");
    Ok(null())
}

fn shard(rt: &mut Runtime, implementation: BuiltinMethod) -> Value {
    let (heap, roots) = rt.heap_and_roots();
    let wrapper =
        alloc::new_heap_void_p(heap, roots, implementation as usize).unwrap();
    let mut assm = Assembler::new();
    assm.emit_builtin(wrapper, 0);
    assm.emit_return();
    assm.flush(heap, roots).unwrap()
}

#[test]
fn test_ensure_runs_on_normal_exit() {
    LOG.lock().unwrap().clear();
    let mut rt = new_runtime();
    let shard_code = shard(&mut rt, log_exit);

    let mut assm = Assembler::new();
    assm.emit_create_ensurer(shard_code);
    assm.emit_push(Value::new_integer(5));
    assm.emit_call_ensurer();
    assm.emit_dispose_ensurer();
    assm.emit_return();
    let code = flush(&mut rt, &assm);

    let result = run(&mut rt, code).unwrap();
    assert_eq!(result.as_integer(), 5);
    assert_eq!(*LOG.lock().unwrap(), vec!["exit"]);
}

#[test]
fn test_ensure_runs_on_escape() {
    LOG.lock().unwrap().clear();
    let mut rt = new_runtime();
    let shard_code = shard(&mut rt, log_exit);
    let call = operation(&mut rt, OperationType::Call, "");
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let tags = call_tags(&mut rt, &[subject_key, selector_key, Value::new_integer(0)]);

    // with_escape e { ensure { log.push("exit") } in e(9) }
    let mut assm = Assembler::new();
    let create_pc = assm.emit_create_escape(0);
    assm.emit_create_ensurer(shard_code);
    assm.emit_load_local(ESCAPE_SLOT);
    assm.emit_push(call);
    assm.emit_push(Value::new_integer(9));
    assm.emit_invoke(tags, nothing());
    assm.emit_slap(3);
    assm.emit_call_ensurer();
    assm.emit_dispose_ensurer();
    let join_pc = assm.pc();
    assm.emit_dispose_escape();
    assm.emit_return();
    assm.patch_operand(create_pc, 0, (join_pc - (create_pc + 2)) as u16);
    let code = flush(&mut rt, &assm);

    let result = run(&mut rt, code).expect("escape through ensure");
    assert_eq!(result.as_integer(), 9);
    assert_eq!(*LOG.lock().unwrap(), vec!["exit"]);
}

#[test]
fn test_barriers_fire_innermost_first() {
    LOG.lock().unwrap().clear();
    let mut rt = new_runtime();
    let outer_shard = shard(&mut rt, log_outer);
    let inner_shard = shard(&mut rt, log_inner);
    let call = operation(&mut rt, OperationType::Call, "");
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let tags = call_tags(&mut rt, &[subject_key, selector_key, Value::new_integer(0)]);

    // with_escape e { ensure outer in ensure inner in e(1) }
    let mut assm = Assembler::new();
    let create_pc = assm.emit_create_escape(0);
    assm.emit_create_ensurer(outer_shard);
    assm.emit_create_ensurer(inner_shard);
    assm.emit_load_local(ESCAPE_SLOT);
    assm.emit_push(call);
    assm.emit_push(Value::new_integer(1));
    assm.emit_invoke(tags, nothing());
    assm.emit_slap(3);
    assm.emit_call_ensurer();
    assm.emit_dispose_ensurer();
    assm.emit_call_ensurer();
    assm.emit_dispose_ensurer();
    let join_pc = assm.pc();
    assm.emit_dispose_escape();
    assm.emit_return();
    assm.patch_operand(create_pc, 0, (join_pc - (create_pc + 2)) as u16);
    let code = flush(&mut rt, &assm);

    let result = run(&mut rt, code).unwrap();
    assert_eq!(result.as_integer(), 1);
    // Innermost barrier fires before the outer one.
    assert_eq!(*LOG.lock().unwrap(), vec!["inner", "outer"]);
}

// ─── Method dispatch by type (S5) ─────────────────────────────────────────────

#[test]
fn test_dispatch_picks_the_most_specific_method() {
    let mut rt = new_runtime();
    let f = operation(&mut rt, OperationType::Infix, "f");
    let (type_a, type_b) = {
        let (heap, roots) = rt.heap_and_roots();
        let name_a = alloc::new_heap_utf8(heap, roots, "A").unwrap();
        let name_b = alloc::new_heap_utf8(heap, roots, "B").unwrap();
        let type_a = alloc::new_heap_type(heap, roots, name_a).unwrap();
        let type_b = alloc::new_heap_type(heap, roots, name_b).unwrap();
        (type_a, type_b)
    };
    // B <: A in the ambient space.
    {
        let space = rt.roots.builtin_methodspace();
        let (heap, roots) = rt.heap_and_roots();
        method::add_methodspace_inheritance(heap, roots, space, type_b, type_a).unwrap();
    }
    add_constant_method(&mut rt, type_a, f, Value::new_integer(1));
    add_constant_method(&mut rt, type_b, f, Value::new_integer(2));

    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let tags = call_tags(&mut rt, &[subject_key, selector_key]);

    let b = instance_of(&mut rt, type_b);
    let mut assm = Assembler::new();
    assm.emit_push(b);
    assm.emit_push(f);
    assm.emit_invoke(tags, nothing());
    assm.emit_slap(2);
    assm.emit_return();
    let code = flush(&mut rt, &assm);
    let result = run(&mut rt, code).unwrap();
    assert_eq!(result.as_integer(), 2, "f(b) should pick the B method");

    let a = instance_of(&mut rt, type_a);
    let mut assm = Assembler::new();
    assm.emit_push(a);
    assm.emit_push(f);
    assm.emit_invoke(tags, nothing());
    assm.emit_slap(2);
    assm.emit_return();
    let code = flush(&mut rt, &assm);
    let result = run(&mut rt, code).unwrap();
    assert_eq!(result.as_integer(), 1, "f(a) should pick the A method");
}

// ─── Signals (S6) ─────────────────────────────────────────────────────────────

#[test]
fn test_unhandled_signal_escapes_with_backtrace() {
    let mut rt = new_runtime();
    let sig = operation(&mut rt, OperationType::Infix, "no_handler");
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let tags = call_tags(&mut rt, &[subject_key, selector_key]);

    let mut assm = Assembler::new();
    assm.emit_push(null());
    assm.emit_push(sig);
    assm.emit_signal_escape(tags);
    assm.emit_slap(2);
    assm.emit_return();
    let code = flush(&mut rt, &assm);

    let result = run(&mut rt, code);
    assert!(matches!(result, Err(c) if c.cause() == ConditionCause::Signal));
    let backtrace = rt.last_backtrace.clone().expect("a backtrace was captured");
    assert!(backtrace.contains("leave"), "backtrace was: {}", backtrace);
    assert!(backtrace.contains("no_handler"), "backtrace was: {}", backtrace);
}

#[test]
fn test_unhandled_signal_continue_takes_default_branch() {
    let mut rt = new_runtime();
    let sig = operation(&mut rt, OperationType::Infix, "warn");
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let tags = call_tags(&mut rt, &[subject_key, selector_key]);

    let mut assm = Assembler::new();
    assm.emit_push(null());
    assm.emit_push(sig);
    assm.emit_signal_continue(tags);
    // Handled path returns here and jumps over the default branch.
    let goto_pc = assm.emit_goto_forward();
    assm.emit_push(Value::new_integer(42)); // default branch
    assm.bind_goto(goto_pc);
    assm.emit_slap(2);
    assm.emit_return();
    let code = flush(&mut rt, &assm);

    let result = run(&mut rt, code).unwrap();
    assert_eq!(result.as_integer(), 42);
}

#[test]
fn test_signal_handler_replies() {
    let mut rt = new_runtime();
    let sig = operation(&mut rt, OperationType::Infix, "ask");
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let tags = call_tags(&mut rt, &[subject_key, selector_key]);

    // The handler space answers `ask` on any subject by returning 7, which
    // continues at the signal site.
    let handler_space = {
        let (heap, roots) = rt.heap_and_roots();
        alloc::new_heap_methodspace(heap, roots).unwrap()
    };
    let mut body = Assembler::new();
    body.emit_push(Value::new_integer(7));
    body.emit_return();
    let handler_code = flush(&mut rt, &body);
    {
        let (heap, roots) = rt.heap_and_roots();
        let any_guard = alloc::new_heap_guard(heap, roots, GuardType::Any, nothing()).unwrap();
        let eq_guard = alloc::new_heap_guard(heap, roots, GuardType::Eq, sig).unwrap();
        let subject_tags = alloc::new_heap_array_with(heap, roots, &[roots.subject_key()]).unwrap();
        let subject_param =
            alloc::new_heap_parameter(heap, roots, any_guard, subject_tags, false, 0).unwrap();
        let selector_tags =
            alloc::new_heap_array_with(heap, roots, &[roots.selector_key()]).unwrap();
        let selector_param =
            alloc::new_heap_parameter(heap, roots, eq_guard, selector_tags, false, 1).unwrap();
        let tags_array = alloc::new_heap_array(heap, roots, 4).unwrap();
        umbra::objects::set_pair_array_first_at(tags_array, 0, roots.subject_key());
        umbra::objects::set_pair_array_second_at(tags_array, 0, subject_param);
        umbra::objects::set_pair_array_first_at(tags_array, 1, roots.selector_key());
        umbra::objects::set_pair_array_second_at(tags_array, 1, selector_param);
        umbra::objects::co_sort_pair_array(tags_array);
        let signature = alloc::new_heap_signature(heap, roots, tags_array, 2, 2, false).unwrap();
        let m = alloc::new_heap_method(heap, roots, signature, handler_code, nothing(), nothing(), 0)
            .unwrap();
        method::add_methodspace_method(heap, roots, handler_space, m).unwrap();
    }

    let mut assm = Assembler::new();
    let install_pc = assm.emit_install_signal_handler(handler_space, 0);
    assm.emit_push(null());
    assm.emit_push(sig);
    assm.emit_signal_continue(tags);
    let goto_pc = assm.emit_goto_forward();
    assm.emit_push(Value::new_integer(0)); // default branch: no handler
    assm.bind_goto(goto_pc);
    assm.emit_slap(2);
    let leave_dest = assm.pc();
    assm.emit_uninstall_signal_handler();
    assm.emit_return();
    assm.patch_operand(install_pc, 1, (leave_dest - (install_pc + 3)) as u16);
    let code = flush(&mut rt, &assm);

    let result = run(&mut rt, code).unwrap();
    assert_eq!(result.as_integer(), 7, "the handler's reply continues at the signal");
}

#[test]
fn test_signal_handler_leaves_to_install_site() {
    let mut rt = new_runtime();
    let sig = operation(&mut rt, OperationType::Infix, "bail");
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let tags = call_tags(&mut rt, &[subject_key, selector_key]);

    // The handler leaves with 13 instead of replying: it walks the barriers
    // back to its own section and restores the install-site state.
    let handler_space = {
        let (heap, roots) = rt.heap_and_roots();
        alloc::new_heap_methodspace(heap, roots).unwrap()
    };
    let mut body = Assembler::new();
    body.emit_load_argument(0);
    body.emit_push(Value::new_integer(13));
    body.emit_push(null());
    body.emit_push(null());
    body.emit_leave_or_fire_barrier(1);
    let handler_code = flush(&mut rt, &body);
    {
        let (heap, roots) = rt.heap_and_roots();
        let any_guard = alloc::new_heap_guard(heap, roots, GuardType::Any, nothing()).unwrap();
        let eq_guard = alloc::new_heap_guard(heap, roots, GuardType::Eq, sig).unwrap();
        let subject_tags = alloc::new_heap_array_with(heap, roots, &[roots.subject_key()]).unwrap();
        let subject_param =
            alloc::new_heap_parameter(heap, roots, any_guard, subject_tags, false, 0).unwrap();
        let selector_tags =
            alloc::new_heap_array_with(heap, roots, &[roots.selector_key()]).unwrap();
        let selector_param =
            alloc::new_heap_parameter(heap, roots, eq_guard, selector_tags, false, 1).unwrap();
        let tags_array = alloc::new_heap_array(heap, roots, 4).unwrap();
        umbra::objects::set_pair_array_first_at(tags_array, 0, roots.subject_key());
        umbra::objects::set_pair_array_second_at(tags_array, 0, subject_param);
        umbra::objects::set_pair_array_first_at(tags_array, 1, roots.selector_key());
        umbra::objects::set_pair_array_second_at(tags_array, 1, selector_param);
        umbra::objects::co_sort_pair_array(tags_array);
        let signature = alloc::new_heap_signature(heap, roots, tags_array, 2, 2, false).unwrap();
        let m = alloc::new_heap_method(heap, roots, signature, handler_code, nothing(), nothing(), 0)
            .unwrap();
        method::add_methodspace_method(heap, roots, handler_space, m).unwrap();
    }

    let mut assm = Assembler::new();
    let install_pc = assm.emit_install_signal_handler(handler_space, 0);
    assm.emit_push(null());
    assm.emit_push(sig);
    assm.emit_signal_continue(tags);
    let goto_pc = assm.emit_goto_forward();
    assm.emit_push(Value::new_integer(0));
    assm.bind_goto(goto_pc);
    assm.emit_slap(2);
    let leave_dest = assm.pc();
    assm.emit_uninstall_signal_handler();
    assm.emit_return();
    assm.patch_operand(install_pc, 1, (leave_dest - (install_pc + 3)) as u16);
    let code = flush(&mut rt, &assm);

    let result = run(&mut rt, code).unwrap();
    assert_eq!(result.as_integer(), 13, "leave delivers at the install site");
}

// ─── Blocks and refraction ────────────────────────────────────────────────────

#[test]
fn test_block_reads_outer_local_through_refraction() {
    let mut rt = new_runtime();
    let call = operation(&mut rt, OperationType::Call, "");
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let tags = call_tags(&mut rt, &[subject_key, selector_key]);

    // The block's own methodspace: block() reads local 0 of the frame that
    // created the block, one refraction step out.
    let block_space = {
        let (heap, roots) = rt.heap_and_roots();
        alloc::new_heap_methodspace(heap, roots).unwrap()
    };
    let mut body = Assembler::new();
    body.emit_load_refracted_local(0, 1);
    body.emit_return();
    let body_code = flush(&mut rt, &body);
    {
        let (heap, roots) = rt.heap_and_roots();
        let any_guard = alloc::new_heap_guard(heap, roots, GuardType::Any, nothing()).unwrap();
        let eq_guard = alloc::new_heap_guard(heap, roots, GuardType::Eq, call).unwrap();
        let subject_tags = alloc::new_heap_array_with(heap, roots, &[roots.subject_key()]).unwrap();
        let subject_param =
            alloc::new_heap_parameter(heap, roots, any_guard, subject_tags, false, 0).unwrap();
        let selector_tags =
            alloc::new_heap_array_with(heap, roots, &[roots.selector_key()]).unwrap();
        let selector_param =
            alloc::new_heap_parameter(heap, roots, eq_guard, selector_tags, false, 1).unwrap();
        let tags_array = alloc::new_heap_array(heap, roots, 4).unwrap();
        umbra::objects::set_pair_array_first_at(tags_array, 0, roots.subject_key());
        umbra::objects::set_pair_array_second_at(tags_array, 0, subject_param);
        umbra::objects::set_pair_array_first_at(tags_array, 1, roots.selector_key());
        umbra::objects::set_pair_array_second_at(tags_array, 1, selector_param);
        umbra::objects::co_sort_pair_array(tags_array);
        let signature = alloc::new_heap_signature(heap, roots, tags_array, 2, 2, false).unwrap();
        let m = alloc::new_heap_method(heap, roots, signature, body_code, nothing(), nothing(), 0)
            .unwrap();
        method::add_methodspace_method(heap, roots, block_space, m).unwrap();
    }

    // Outer code: a local, a block over it, a call through the block, then
    // the block is dissolved.
    const BLOCK_SLOT: usize = 6; // local 0, then the five section slots
    let mut assm = Assembler::new();
    assm.emit_push(Value::new_integer(5));
    assm.emit_create_block(block_space);
    assm.emit_load_local(BLOCK_SLOT);
    assm.emit_push(call);
    assm.emit_invoke(tags, nothing());
    assm.emit_slap(2);
    assm.emit_dispose_block();
    assm.emit_slap(1);
    assm.emit_return();
    let code = flush(&mut rt, &assm);

    let result = run(&mut rt, code).expect("block call should refract");
    assert_eq!(result.as_integer(), 5);
}

// ─── Call data and private invocation ─────────────────────────────────────────

#[test]
fn test_call_data_private_invoke() {
    let mut rt = new_runtime();
    let poke = operation(&mut rt, OperationType::Infix, "poke");
    let private_invoke = operation(&mut rt, OperationType::Infix, "private_invoke");
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();

    // A bound module whose fragment methodspace answers poke with 42.
    let fragment = {
        let loader = rt.roots.module_loader();
        let (heap, roots) = rt.heap_and_roots();
        let module_path = umbra::bind::new_heap_path_with_names(heap, roots, &["m"]).unwrap();
        let any_guard = alloc::new_heap_guard(heap, roots, GuardType::Any, nothing()).unwrap();
        let eq_guard = alloc::new_heap_guard(heap, roots, GuardType::Eq, poke).unwrap();
        let subject_tags = alloc::new_heap_array_with(heap, roots, &[roots.subject_key()]).unwrap();
        let subject_param =
            alloc::new_heap_parameter(heap, roots, any_guard, subject_tags, false, 0).unwrap();
        let selector_tags =
            alloc::new_heap_array_with(heap, roots, &[roots.selector_key()]).unwrap();
        let selector_param =
            alloc::new_heap_parameter(heap, roots, eq_guard, selector_tags, false, 1).unwrap();
        let tags_array = alloc::new_heap_array(heap, roots, 4).unwrap();
        umbra::objects::set_pair_array_first_at(tags_array, 0, roots.subject_key());
        umbra::objects::set_pair_array_second_at(tags_array, 0, subject_param);
        umbra::objects::set_pair_array_first_at(tags_array, 1, roots.selector_key());
        umbra::objects::set_pair_array_second_at(tags_array, 1, selector_param);
        umbra::objects::co_sort_pair_array(tags_array);
        let signature = alloc::new_heap_signature(heap, roots, tags_array, 2, 2, false).unwrap();
        let mut body = Assembler::new();
        body.emit_push(Value::new_integer(42));
        body.emit_return();
        let body_code = body.flush(heap, roots).unwrap();
        let poke_method =
            alloc::new_heap_method(heap, roots, signature, body_code, nothing(), nothing(), 0)
                .unwrap();
        let element = alloc::new_heap_array_with(
            heap,
            roots,
            &[
                Value::new_integer(umbra::bind::element_kind::METHOD),
                poke_method,
                nothing(),
            ],
        )
        .unwrap();
        let elements = alloc::new_heap_array_with(heap, roots, &[element]).unwrap();
        let imports = alloc::new_heap_array(heap, roots, 0).unwrap();
        let unbound_fragment = alloc::new_heap_unbound_module_fragment(
            heap,
            roots,
            umbra::core::tagged::new_stage_offset(0),
            imports,
            elements,
        )
        .unwrap();
        let fragments = alloc::new_heap_array_with(heap, roots, &[unbound_fragment]).unwrap();
        let module =
            alloc::new_heap_unbound_module(heap, roots, module_path, fragments).unwrap();
        umbra::maps::set_id_hash_map_at(
            heap,
            roots,
            umbra::bind::get_module_loader_modules(loader),
            module_path,
            module,
        )
        .unwrap();
        umbra::bind::bind_modules(&mut rt).unwrap();
        let bound = rt.roots.bound_module_map();
        let module = umbra::maps::get_id_hash_map_at(bound, module_path).unwrap();
        umbra::bind::get_module_fragment_at(module, 0).unwrap()
    };
    let private = umbra::bind::get_module_fragment_private(fragment);

    // The trampoline method that performs the private lookup.
    let mut trampoline = Assembler::new();
    trampoline.emit_module_fragment_private_invoke();
    trampoline.emit_return();
    let trampoline_code = flush(&mut rt, &trampoline);
    add_method_with_code(&mut rt, nothing(), private_invoke, trampoline_code, 1);

    // Main: build the call data, then invoke the trampoline with it.
    let outer_tags =
        call_tags(&mut rt, &[subject_key, selector_key, Value::new_integer(0)]);
    let mut assm = Assembler::new();
    assm.emit_push(private);
    assm.emit_push(private_invoke);
    assm.emit_push(subject_key);
    assm.emit_push(Value::new_integer(7));
    assm.emit_push(selector_key);
    assm.emit_push(poke);
    assm.emit_create_call_data(2);
    assm.emit_invoke(outer_tags, nothing());
    assm.emit_slap(3);
    assm.emit_return();
    let code = flush(&mut rt, &assm);

    let result = run(&mut rt, code).expect("private invoke should dispatch");
    assert_eq!(result.as_integer(), 42);
}

#[test]
fn test_check_stack_height_passes() {
    let mut rt = new_runtime();
    let mut assm = Assembler::new();
    assm.emit_push(Value::new_integer(1));
    assm.emit_push(Value::new_integer(2));
    assm.emit_check_stack_height();
    assm.emit_pop(1);
    assm.emit_return();
    let code = flush(&mut rt, &assm);
    let result = run(&mut rt, code).unwrap();
    assert_eq!(result.as_integer(), 1);
}

// ─── Lambdas ──────────────────────────────────────────────────────────────────

#[test]
fn test_lambda_call_reads_its_capture() {
    let mut rt = new_runtime();
    let call = operation(&mut rt, OperationType::Call, "");
    let subject_key = rt.roots.subject_key();
    let selector_key = rt.roots.selector_key();
    let tags = call_tags(&mut rt, &[subject_key, selector_key]);

    // The lambda's methodspace: lambda() returns capture 0.
    let lambda_space = {
        let (heap, roots) = rt.heap_and_roots();
        alloc::new_heap_methodspace(heap, roots).unwrap()
    };
    let mut body = Assembler::new();
    body.emit_load_lambda_capture(0);
    body.emit_return();
    let body_code = flush(&mut rt, &body);
    {
        let (heap, roots) = rt.heap_and_roots();
        let any_guard = alloc::new_heap_guard(heap, roots, GuardType::Any, nothing()).unwrap();
        let eq_guard = alloc::new_heap_guard(heap, roots, GuardType::Eq, call).unwrap();
        let subject_tags = alloc::new_heap_array_with(heap, roots, &[roots.subject_key()]).unwrap();
        let subject_param =
            alloc::new_heap_parameter(heap, roots, any_guard, subject_tags, false, 0).unwrap();
        let selector_tags =
            alloc::new_heap_array_with(heap, roots, &[roots.selector_key()]).unwrap();
        let selector_param =
            alloc::new_heap_parameter(heap, roots, eq_guard, selector_tags, false, 1).unwrap();
        let tags_array = alloc::new_heap_array(heap, roots, 4).unwrap();
        umbra::objects::set_pair_array_first_at(tags_array, 0, roots.subject_key());
        umbra::objects::set_pair_array_second_at(tags_array, 0, subject_param);
        umbra::objects::set_pair_array_first_at(tags_array, 1, roots.selector_key());
        umbra::objects::set_pair_array_second_at(tags_array, 1, selector_param);
        umbra::objects::co_sort_pair_array(tags_array);
        let signature = alloc::new_heap_signature(heap, roots, tags_array, 2, 2, false).unwrap();
        let m = alloc::new_heap_method(heap, roots, signature, body_code, nothing(), nothing(), 0)
            .unwrap();
        method::add_methodspace_method(heap, roots, lambda_space, m).unwrap();
    }

    // Close over 99 and call the lambda.
    let mut assm = Assembler::new();
    assm.emit_push(Value::new_integer(99));
    assm.emit_lambda(lambda_space, 1);
    assm.emit_load_local(0);
    assm.emit_push(call);
    assm.emit_invoke(tags, nothing());
    assm.emit_slap(2);
    assm.emit_slap(1);
    assm.emit_return();
    let code = flush(&mut rt, &assm);

    let result = run(&mut rt, code).expect("lambda call should delegate");
    assert_eq!(result.as_integer(), 99);
}
