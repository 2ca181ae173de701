/// Built-in Methods
///
/// Native implementations reachable through normal method dispatch. A
/// builtin is a plain function pointer wrapped in a VoidP in the method's
/// code; the Builtin opcode unwraps and calls it with a view of the frame.
/// The trampolines that make `lambda()` and `block()` work carry delegate
/// flags instead of real code: the lookup layer consumes them and re-runs
/// the lookup in the subject's own methodspace.

use crate::core::tagged::{new_boolean, nothing};
use crate::core::value::{Condition, ConditionCause, Value};
use crate::heap::Heap;
use crate::method::{method_flags, GuardType};
use crate::objects::OperationType;
use crate::runtime::{Roots, Runtime};
use crate::species::Family;
use crate::stack::Frame;

// ---------------------------------------------------------------------------
// Builtin calling convention
// ---------------------------------------------------------------------------

pub type BuiltinMethod = fn(&mut BuiltinArguments) -> Result<Value, Condition>;

/// View of the current invocation a builtin sees: the subject, the
/// positional arguments, and enough runtime to allocate results.
pub struct BuiltinArguments<'a> {
    pub runtime: &'a mut Runtime,
    pub frame: &'a mut Frame,
    pub process: Value,
}

impl<'a> BuiltinArguments<'a> {
    pub fn new(
        runtime: &'a mut Runtime,
        frame: &'a mut Frame,
        process: Value,
    ) -> BuiltinArguments<'a> {
        BuiltinArguments { runtime, frame, process }
    }

    pub fn subject(&self) -> Value {
        self.frame.get_argument(0)
    }

    pub fn selector(&self) -> Value {
        self.frame.get_argument(1)
    }

    /// The index'th positional argument; parameter indexes 0 and 1 are the
    /// subject and selector.
    pub fn argument(&self, index: usize) -> Value {
        self.frame.get_argument(index + 2)
    }
}

/// Recovers the function pointer stored in a builtin wrapper.
pub fn builtin_from_wrapper(ptr: usize) -> BuiltinMethod {
    debug_assert_ne!(ptr, 0);
    unsafe { std::mem::transmute::<usize, BuiltinMethod>(ptr) }
}

fn new_builtin_wrapper(
    heap: &mut Heap,
    roots: &Roots,
    implementation: BuiltinMethod,
) -> Result<Value, Condition> {
    crate::alloc::new_heap_void_p(heap, roots, implementation as usize)
}

// ---------------------------------------------------------------------------
// Integer arithmetic
// ---------------------------------------------------------------------------

fn expect_integer(value: Value) -> Result<i64, Condition> {
    if !value.is_integer() {
        return Err(Condition::invalid_input());
    }
    Ok(value.as_integer())
}

fn integer_plus(args: &mut BuiltinArguments) -> Result<Value, Condition> {
    let a = expect_integer(args.subject())?;
    let b = expect_integer(args.argument(0))?;
    Ok(Value::new_integer(a.wrapping_add(b)))
}

fn integer_minus(args: &mut BuiltinArguments) -> Result<Value, Condition> {
    let a = expect_integer(args.subject())?;
    let b = expect_integer(args.argument(0))?;
    Ok(Value::new_integer(a.wrapping_sub(b)))
}

fn integer_times(args: &mut BuiltinArguments) -> Result<Value, Condition> {
    let a = expect_integer(args.subject())?;
    let b = expect_integer(args.argument(0))?;
    Ok(Value::new_integer(a.wrapping_mul(b)))
}

fn integer_equals(args: &mut BuiltinArguments) -> Result<Value, Condition> {
    let a = expect_integer(args.subject())?;
    let b = expect_integer(args.argument(0))?;
    Ok(new_boolean(a == b))
}

fn integer_less(args: &mut BuiltinArguments) -> Result<Value, Condition> {
    let a = expect_integer(args.subject())?;
    let b = expect_integer(args.argument(0))?;
    Ok(new_boolean(a < b))
}

fn integer_negate(args: &mut BuiltinArguments) -> Result<Value, Condition> {
    let a = expect_integer(args.subject())?;
    Ok(Value::new_integer(-a))
}

// ---------------------------------------------------------------------------
// Liveness probes
// ---------------------------------------------------------------------------

fn escape_is_live(args: &mut BuiltinArguments) -> Result<Value, Condition> {
    Ok(new_boolean(crate::closures::is_escape_live(args.subject())))
}

fn block_is_live(args: &mut BuiltinArguments) -> Result<Value, Condition> {
    Ok(new_boolean(crate::closures::is_block_live(args.subject())))
}

fn promise_is_settled(args: &mut BuiltinArguments) -> Result<Value, Condition> {
    Ok(new_boolean(crate::instance::is_promise_settled(args.subject())))
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// How the body of a registered method is produced.
enum MethodBody {
    /// [Builtin wrapper; Return]
    Builtin(BuiltinMethod),
    /// [FireEscapeOrBarrier] — never returns normally.
    FireEscape,
    /// [DelegateToLambda] — consumed by lookup.
    DelegateToLambda,
    /// [DelegateToBlock] — consumed by lookup.
    DelegateToBlock,
}

struct MethodSpec<'a> {
    subject_type: Value,
    operation_type: OperationType,
    operation_name: &'a str,
    positional_count: usize,
    allow_extra: bool,
    flags: u64,
    body: MethodBody,
}

fn add_builtin_method(runtime: &mut Runtime, spec: MethodSpec) -> Result<(), Condition> {
    let (heap, roots) = runtime.heap_and_roots();

    // The selector value this method answers to.
    let name = crate::alloc::new_heap_utf8(heap, roots, spec.operation_name)?;
    let operation =
        crate::alloc::new_heap_operation(heap, roots, spec.operation_type, name)?;

    // Parameters: subject, selector, then the positionals.
    let param_count = 2 + spec.positional_count;
    let subject_guard = crate::alloc::new_heap_guard(heap, roots, GuardType::Is, spec.subject_type)?;
    let selector_guard = crate::alloc::new_heap_guard(heap, roots, GuardType::Eq, operation)?;
    let any_guard = crate::alloc::new_heap_guard(heap, roots, GuardType::Any, nothing())?;

    let mut tags_and_params: Vec<(Value, Value)> = Vec::with_capacity(param_count);
    let subject_tags = crate::alloc::new_heap_array_with(heap, roots, &[roots.subject_key()])?;
    let subject_param =
        crate::alloc::new_heap_parameter(heap, roots, subject_guard, subject_tags, false, 0)?;
    tags_and_params.push((roots.subject_key(), subject_param));
    let selector_tags = crate::alloc::new_heap_array_with(heap, roots, &[roots.selector_key()])?;
    let selector_param =
        crate::alloc::new_heap_parameter(heap, roots, selector_guard, selector_tags, false, 1)?;
    tags_and_params.push((roots.selector_key(), selector_param));
    for i in 0..spec.positional_count {
        let tag = Value::new_integer(i as i64);
        let tags = crate::alloc::new_heap_array_with(heap, roots, &[tag])?;
        let param = crate::alloc::new_heap_parameter(heap, roots, any_guard, tags, false, 2 + i)?;
        tags_and_params.push((tag, param));
    }

    let tags = crate::alloc::new_heap_array(heap, roots, param_count * 2)?;
    for (i, (tag, param)) in tags_and_params.iter().enumerate() {
        crate::objects::set_pair_array_first_at(tags, i, *tag);
        crate::objects::set_pair_array_second_at(tags, i, *param);
    }
    crate::objects::co_sort_pair_array(tags);
    let signature = crate::alloc::new_heap_signature(
        heap,
        roots,
        tags,
        param_count,
        param_count,
        spec.allow_extra,
    )?;

    // The body.
    let mut assm = crate::bytecode::Assembler::new();
    match spec.body {
        MethodBody::Builtin(implementation) => {
            let wrapper = new_builtin_wrapper(heap, roots, implementation)?;
            assm.emit_builtin(wrapper, 0);
            assm.emit_return();
        }
        MethodBody::FireEscape => {
            // Two scratch slots for the barrier walk: each fired ensure
            // shard leaves (shard, result) on this frame and the walk pops
            // a pair per step, the first pair being these.
            assm.emit_push(crate::core::tagged::null());
            assm.emit_push(crate::core::tagged::null());
            assm.emit_fire_escape_or_barrier();
        }
        MethodBody::DelegateToLambda => assm.emit_delegate_to_lambda(),
        MethodBody::DelegateToBlock => assm.emit_delegate_to_block(),
    }
    let code = assm.flush(heap, roots)?;

    let method =
        crate::alloc::new_heap_method(heap, roots, signature, code, nothing(), nothing(), spec.flags)?;
    crate::method::add_methodspace_method(heap, roots, roots.builtin_methodspace(), method)
}

/// Installs the built-in methods into the root methodspace. Called once at
/// runtime initialization, before fuzzing is armed.
pub fn register_builtin_methods(runtime: &mut Runtime) -> Result<(), Condition> {
    let integer_type = runtime.roots.builtin_type_for_immediate(Value::new_integer(0));
    let escape_type = runtime.roots.builtin_type_for_family(Family::Escape);
    let lambda_type = runtime.roots.builtin_type_for_family(Family::Lambda);
    let block_type = runtime.roots.builtin_type_for_family(Family::Block);
    let promise_type = runtime.roots.builtin_type_for_family(Family::Promise);

    let integer_ops: [(&str, usize, BuiltinMethod); 6] = [
        ("+", 1, integer_plus),
        ("-", 1, integer_minus),
        ("*", 1, integer_times),
        ("==", 1, integer_equals),
        ("<", 1, integer_less),
        ("negate", 0, integer_negate),
    ];
    for (name, posc, implementation) in integer_ops {
        add_builtin_method(
            runtime,
            MethodSpec {
                subject_type: integer_type,
                operation_type: OperationType::Infix,
                operation_name: name,
                positional_count: posc,
                allow_extra: false,
                flags: 0,
                body: MethodBody::Builtin(implementation),
            },
        )?;
    }

    // escape(value): fires the escape, unwinding barriers on the way.
    add_builtin_method(
        runtime,
        MethodSpec {
            subject_type: escape_type,
            operation_type: OperationType::Call,
            operation_name: "",
            positional_count: 1,
            allow_extra: false,
            flags: 0,
            body: MethodBody::FireEscape,
        },
    )?;
    add_builtin_method(
        runtime,
        MethodSpec {
            subject_type: escape_type,
            operation_type: OperationType::Property,
            operation_name: "is_live?",
            positional_count: 0,
            allow_extra: false,
            flags: 0,
            body: MethodBody::Builtin(escape_is_live),
        },
    )?;

    // lambda()/block(): trampolines resolved during lookup.
    add_builtin_method(
        runtime,
        MethodSpec {
            subject_type: lambda_type,
            operation_type: OperationType::Call,
            operation_name: "",
            positional_count: 0,
            allow_extra: true,
            flags: method_flags::LAMBDA_DELEGATE,
            body: MethodBody::DelegateToLambda,
        },
    )?;
    add_builtin_method(
        runtime,
        MethodSpec {
            subject_type: block_type,
            operation_type: OperationType::Call,
            operation_name: "",
            positional_count: 0,
            allow_extra: true,
            flags: method_flags::BLOCK_DELEGATE,
            body: MethodBody::DelegateToBlock,
        },
    )?;
    add_builtin_method(
        runtime,
        MethodSpec {
            subject_type: block_type,
            operation_type: OperationType::Property,
            operation_name: "is_live?",
            positional_count: 0,
            allow_extra: false,
            flags: 0,
            body: MethodBody::Builtin(block_is_live),
        },
    )?;

    add_builtin_method(
        runtime,
        MethodSpec {
            subject_type: promise_type,
            operation_type: OperationType::Property,
            operation_name: "is_settled?",
            positional_count: 0,
            allow_extra: false,
            flags: 0,
            body: MethodBody::Builtin(promise_is_settled),
        },
    )?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Signal helper for builtins
// ---------------------------------------------------------------------------

/// For BuiltinMaybeEscape implementations: raise a signal the surrounding
/// handler machinery can catch.
pub fn builtin_signal() -> Condition {
    Condition::new(ConditionCause::Signal)
}
