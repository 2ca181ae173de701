/// The Interpreter
///
/// Executes code blocks by reading shorts through a per-frame pc. A code
/// cache mirrors the current frame's bytecode and value pool and must be
/// refreshed on every frame switch. Control flow that crosses frames is
/// expressed through conditions: the inner loop returns them, the outer
/// wrappers recover the two restartable ones (HeapExhausted by collecting,
/// ForceValidate by validating) and resume from the stack, whose lid frames
/// always hold a consistent picture because the frame is closed before any
/// condition escapes.
///
/// Escapes, ensure and signal handlers run through the barrier chain: the
/// firing opcodes execute one barrier per iteration of the loop until the
/// destination barrier is reached, then restore the captured frame state.

use tracing::{error, trace};

use crate::bytecode::{
    get_code_block_bytecode, get_code_block_high_water_mark, get_code_block_value_pool, Opcode,
};
use crate::closures::{
    get_escape_section, get_lambda_capture, set_block_section, set_escape_section,
    set_lambda_captures,
};
use crate::core::tagged::{is_nothing, nothing};
use crate::core::value::{Condition, ConditionCause, Value};
use crate::derived::{
    self, barrier_state_unregister, escape_state_init, frame_alloc_derived_object,
    frame_destroy_derived_object, get_barrier_state_payload, get_barrier_state_previous,
    get_derived_object_host, get_genus_descriptor, get_refractor_refracted_frame, in_genus,
    refraction_point_init, Genus,
};
use crate::heap::SafeValue;
use crate::instance::fulfill_promise;
use crate::maps;
use crate::method::{lookup_method_full, lookup_signal_handler_method, SigmapInput};
use crate::objects::{get_array_at, get_blob_short_at, get_void_p_value, set_array_at};
use crate::process::{
    get_process_root_task, get_task_process, get_task_stack, is_process_idle, take_process_job,
    Job,
};
use crate::runtime::Runtime;
use crate::species::{self, Family, PrintContext};
use crate::stack::{
    close_frame, get_stack_piece_previous, get_stack_top_barrier, open_stack, open_stack_piece,
    push_stack_frame, set_stack_top_piece, Frame, FrameIter,
};

// ---------------------------------------------------------------------------
// Backtrace families
// ---------------------------------------------------------------------------

pub const BACKTRACE_ENTRIES_OFFSET: usize = crate::heap::heap_object_field_offset(0);
pub const BACKTRACE_FIELD_COUNT: usize = 1;

pub const BACKTRACE_ENTRY_INVOCATION_OFFSET: usize = crate::heap::heap_object_field_offset(0);
pub const BACKTRACE_ENTRY_OPCODE_OFFSET: usize = crate::heap::heap_object_field_offset(1);
pub const BACKTRACE_ENTRY_FIELD_COUNT: usize = 2;

pub fn get_backtrace_entries(backtrace: Value) -> Value {
    crate::heap::get_heap_object_field(backtrace, BACKTRACE_ENTRIES_OFFSET)
}

pub fn get_backtrace_entry_invocation(entry: Value) -> Value {
    crate::heap::get_heap_object_field(entry, BACKTRACE_ENTRY_INVOCATION_OFFSET)
}

pub fn get_backtrace_entry_opcode(entry: Value) -> Opcode {
    let raw = crate::heap::get_heap_object_field(entry, BACKTRACE_ENTRY_OPCODE_OFFSET).as_integer();
    Opcode::from_raw(raw as u16).unwrap_or(Opcode::Invoke)
}

// ---------------------------------------------------------------------------
// Code cache
// ---------------------------------------------------------------------------

/// Mirror of the data of the code block currently executing; refreshed on
/// every frame switch so reads don't re-chase the frame header.
struct CodeCache {
    bytecode: Value,
    value_pool: Value,
}

impl CodeCache {
    fn empty() -> CodeCache {
        CodeCache { bytecode: nothing(), value_pool: nothing() }
    }

    fn refresh(&mut self, frame: &Frame) {
        let code_block = frame.get_code_block();
        self.bytecode = get_code_block_bytecode(code_block);
        self.value_pool = get_code_block_value_pool(code_block);
    }

    fn read_short(&self, frame: &Frame, offset: usize) -> u16 {
        get_blob_short_at(self.bytecode, frame.pc + offset)
    }

    fn read_value(&self, frame: &Frame, offset: usize) -> Value {
        let index = self.read_short(frame, offset) as usize;
        get_array_at(self.value_pool, index)
    }
}

// ---------------------------------------------------------------------------
// Escape state transfer
// ---------------------------------------------------------------------------

/// Records the frame's current state in the section so that restoring later
/// brings execution back here, with the pc biased by `pc_offset`.
fn capture_escape_state(section: Value, frame: &Frame, pc_offset: usize) {
    let bottom = frame.stack_piece_bottom();
    escape_state_init(
        section,
        (frame.stack_pointer - bottom) / crate::core::value::VALUE_SIZE,
        (frame.frame_pointer - bottom) / crate::core::value::VALUE_SIZE,
        (frame.limit_pointer - bottom) / crate::core::value::VALUE_SIZE,
        frame.flags,
        frame.pc + pc_offset,
    );
}

/// Restores the interpreter state recorded in a section, switching pieces
/// if the section lives on another one.
fn restore_escape_state(frame: &mut Frame, stack: Value, destination: Value) {
    let target_piece = get_derived_object_host(destination);
    if target_piece != frame.stack_piece {
        set_stack_top_piece(stack, target_piece);
        open_stack_piece(target_piece, frame);
    }
    let bottom = frame.stack_piece_bottom();
    let word = crate::core::value::VALUE_SIZE;
    frame.stack_pointer =
        bottom + derived::get_escape_state_stack_pointer(destination).as_integer() as usize * word;
    frame.frame_pointer =
        bottom + derived::get_escape_state_frame_pointer(destination).as_integer() as usize * word;
    frame.limit_pointer =
        bottom + derived::get_escape_state_limit_pointer(destination).as_integer() as usize * word;
    frame.flags = derived::get_escape_state_flags(destination);
    frame.pc = derived::get_escape_state_pc(destination).as_integer() as usize;
}

/// Fires the next barrier on the way to the destination. Returns true when
/// the destination itself is the next barrier (arrival), false when an
/// intervening barrier was fired and the loop should come around again.
fn maybe_fire_next_barrier(
    runtime: &mut Runtime,
    cache: &mut CodeCache,
    frame: &mut Frame,
    stack: Value,
    destination: Value,
) -> Result<bool, Condition> {
    debug_assert!(destination.is_derived_object());
    let next_barrier = get_stack_top_barrier(stack);
    if next_barrier == destination {
        return Ok(true);
    }
    let payload = get_barrier_state_payload(next_barrier);
    let previous = get_barrier_state_previous(next_barrier);
    // Unhook the barrier from the chain before running anything.
    crate::stack::set_stack_top_barrier(stack, previous);
    if in_genus(Genus::EnsureSection, next_barrier) {
        // Pop previous shard state off: the result of an earlier shard and
        // the shard itself, then push this barrier as the shard subject so
        // refraction works from inside the shard code.
        frame.pop_value();
        frame.pop_value();
        frame.push_value(next_barrier)?;
        let code_block = payload;
        let (heap, roots) = runtime.heap_and_roots();
        let arg_map = roots.array_of_zero();
        push_stack_frame(
            heap,
            roots,
            stack,
            frame,
            get_code_block_high_water_mark(code_block),
            arg_map,
        )?;
        frame.set_code_block(code_block);
        cache.refresh(frame);
    } else {
        derived::on_derived_object_exit(next_barrier);
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// Interrupt scheduling
// ---------------------------------------------------------------------------

#[cfg(feature = "expensive-checks")]
const FORCE_VALIDATE_INTERVAL: u64 = 2048;

#[cfg(feature = "expensive-checks")]
fn maybe_interrupt(counter: &mut u64) -> Result<(), Condition> {
    *counter += 1;
    if *counter % FORCE_VALIDATE_INTERVAL == 0 {
        return Err(Condition::force_validate(*counter / FORCE_VALIDATE_INTERVAL));
    }
    Ok(())
}

#[cfg(not(feature = "expensive-checks"))]
fn maybe_interrupt(_counter: &mut u64) -> Result<(), Condition> {
    Ok(())
}

// ---------------------------------------------------------------------------
// The interpreter loop
// ---------------------------------------------------------------------------

/// Runs the task until a condition occurs or evaluation completes. The
/// frame is always closed before this returns, so the stack can be reopened
/// after a collection.
pub fn run_task_pushing_signals(
    runtime: &mut Runtime,
    ambience: Value,
    task: Value,
) -> Result<Value, Condition> {
    let stack = get_task_stack(task);
    let process = get_task_process(task);
    let mut frame = open_stack(stack);
    let mut cache = CodeCache::empty();
    cache.refresh(&frame);
    let result = interpreter_loop(runtime, ambience, process, stack, &mut frame, &mut cache);
    close_frame(&mut frame);
    result
}

/// Gets executable code from a method. Methods arrive with their code
/// precompiled; one without is a malformed library.
fn ensure_method_code(method: Value) -> Result<Value, Condition> {
    let code = crate::method::get_method_code(method);
    if is_nothing(code) {
        return Err(Condition::new(ConditionCause::UnknownBuiltin));
    }
    Ok(code)
}

fn log_lookup_error(condition: Condition, input: &SigmapInput) {
    let mut context = PrintContext::new();
    context.buf.push('{');
    for i in 0..input.argument_count() {
        if i > 0 {
            context.buf.push_str(", ");
        }
        species::value_print_on(input.tag_at(i), &mut context);
        context.buf.push_str(": ");
        species::value_print_on(input.value_at(i), &mut context);
    }
    context.buf.push('}');
    error!(cause = condition.cause().name(), invocation = %context.buf, "lookup failed");
}

fn interpreter_loop(
    runtime: &mut Runtime,
    ambience: Value,
    process: Value,
    stack: Value,
    frame: &mut Frame,
    cache: &mut CodeCache,
) -> Result<Value, Condition> {
    let mut interrupt_counter = 0u64;
    loop {
        let raw_opcode = cache.read_short(frame, 0);
        let opcode = match Opcode::from_raw(raw_opcode) {
            Some(opcode) => opcode,
            None => {
                error!(opcode = raw_opcode, "unexpected opcode");
                return Err(Condition::new(ConditionCause::Wat));
            }
        };
        trace!(opcode = opcode.name(), pc = frame.pc, "execute");
        maybe_interrupt(&mut interrupt_counter)?;
        match opcode {
            Opcode::Push => {
                let value = cache.read_value(frame, 1);
                frame.push_value(value)?;
                frame.pc += Opcode::Push.width();
            }
            Opcode::Pop => {
                let count = cache.read_short(frame, 1) as usize;
                for _ in 0..count {
                    frame.pop_value();
                }
                frame.pc += Opcode::Pop.width();
            }
            Opcode::CheckStackHeight => {
                let expected = cache.read_short(frame, 1) as usize;
                debug_assert_eq!(expected, frame.stack_height(), "stack height");
                frame.pc += Opcode::CheckStackHeight.width();
            }
            Opcode::NewArray => {
                let length = cache.read_short(frame, 1) as usize;
                let (heap, roots) = runtime.heap_and_roots();
                let array = crate::alloc::new_heap_array(heap, roots, length)?;
                for i in 0..length {
                    let element = frame.pop_value();
                    set_array_at(array, length - i - 1, element);
                }
                frame.push_value(array)?;
                frame.pc += Opcode::NewArray.width();
            }
            Opcode::Invoke => {
                let tags = cache.read_value(frame, 1);
                debug_assert!(species::in_family(Family::CallTags, tags));
                let fragment = cache.read_value(frame, 2);
                let (method, arg_map) = {
                    let input = SigmapInput::Frame { frame: &*frame, tags };
                    let (heap, roots) = runtime.heap_and_roots();
                    match lookup_method_full(heap, roots, &input, ambience, fragment) {
                        Err(c) if c.cause() == ConditionCause::LookupError => {
                            log_lookup_error(c, &input);
                            return Err(c);
                        }
                        other => other?,
                    }
                };
                let code_block = ensure_method_code(method)?;
                // Everything that can fail is done, so the pc can move past
                // this instruction before the new frame goes in.
                frame.pc += Opcode::Invoke.width();
                let (heap, roots) = runtime.heap_and_roots();
                push_stack_frame(
                    heap,
                    roots,
                    stack,
                    frame,
                    get_code_block_high_water_mark(code_block),
                    arg_map,
                )?;
                frame.set_code_block(code_block);
                cache.refresh(frame);
            }
            Opcode::SignalContinue | Opcode::SignalEscape => {
                let tags = cache.read_value(frame, 1);
                debug_assert!(species::in_family(Family::CallTags, tags));
                frame.pc += Opcode::SignalEscape.width();
                let is_escape = opcode == Opcode::SignalEscape;
                let lookup = {
                    let input = SigmapInput::Frame { frame: &*frame, tags };
                    let (heap, roots) = runtime.heap_and_roots();
                    lookup_signal_handler_method(heap, roots, &input, frame)
                };
                match lookup {
                    Err(c) if c.cause() == ConditionCause::LookupError => {
                        if is_escape {
                            // No handler: escape the interpreter, leaving a
                            // frame that records the state for backtraces.
                            let (heap, roots) = runtime.heap_and_roots();
                            push_stack_frame(heap, roots, stack, frame, 1, nothing())?;
                            frame.set_code_block(runtime.roots.empty_code_block());
                            return Err(Condition::signal(true));
                        } else {
                            // Not an escape: skip over the goto that jumps
                            // to the handled branch, into the default code.
                            debug_assert_eq!(
                                Opcode::from_raw(cache.read_short(frame, 0)),
                                Some(Opcode::Goto),
                                "signal not followed by goto"
                            );
                            frame.pc += Opcode::Goto.width();
                        }
                    }
                    Err(c) => return Err(c),
                    Ok((method, arg_map, handler)) => {
                        let code_block = ensure_method_code(method)?;
                        let (heap, roots) = runtime.heap_and_roots();
                        push_stack_frame(
                            heap,
                            roots,
                            stack,
                            frame,
                            get_code_block_high_water_mark(code_block),
                            arg_map,
                        )?;
                        frame.set_code_block(code_block);
                        debug_assert!(crate::core::tagged::is_null(frame.get_argument(0)));
                        frame.set_argument(0, handler);
                        cache.refresh(frame);
                    }
                }
            }
            Opcode::Goto => {
                let delta = cache.read_short(frame, 1) as usize;
                frame.pc += delta;
            }
            Opcode::DelegateToLambda | Opcode::DelegateToBlock => {
                // These only appear in the delegate trampolines; delegation
                // happens during lookup, so executing one means the lookup
                // went wrong.
                error!("executed a delegate trampoline");
                return Err(Condition::new(ConditionCause::Wat));
            }
            Opcode::Builtin => {
                let wrapper = cache.read_value(frame, 1);
                let implementation = crate::intrinsics::builtin_from_wrapper(
                    get_void_p_value(wrapper),
                );
                let result = {
                    let mut args =
                        crate::intrinsics::BuiltinArguments::new(runtime, frame, process);
                    implementation(&mut args)?
                };
                frame.push_value(result)?;
                frame.pc += Opcode::Builtin.width();
            }
            Opcode::BuiltinMaybeEscape => {
                let wrapper = cache.read_value(frame, 1);
                let implementation = crate::intrinsics::builtin_from_wrapper(
                    get_void_p_value(wrapper),
                );
                let outcome = {
                    let mut args =
                        crate::intrinsics::BuiltinArguments::new(runtime, frame, process);
                    implementation(&mut args)
                };
                match outcome {
                    Ok(result) => {
                        frame.push_value(result)?;
                        frame.pc += Opcode::BuiltinMaybeEscape.width();
                    }
                    Err(c) if c.cause() == ConditionCause::Signal => {
                        // The builtin signalled. The invocation tags are on
                        // top of the stack; find a handler for them.
                        let tags = frame.pop_value();
                        debug_assert!(species::in_family(Family::CallTags, tags));
                        let lookup = {
                            let input = SigmapInput::Frame { frame: &*frame, tags };
                            let (heap, roots) = runtime.heap_and_roots();
                            lookup_signal_handler_method(heap, roots, &input, frame)
                        };
                        match lookup {
                            Err(c) if c.cause() == ConditionCause::LookupError => {
                                // Put the record back for the backtrace.
                                frame.push_value(tags)?;
                                frame.pc += Opcode::BuiltinMaybeEscape.width();
                                let (heap, roots) = runtime.heap_and_roots();
                                push_stack_frame(heap, roots, stack, frame, 1, nothing())?;
                                frame.set_code_block(runtime.roots.empty_code_block());
                                return Err(Condition::signal(true));
                            }
                            Err(c) => return Err(c),
                            Ok((method, arg_map, handler)) => {
                                // Skip forward to the leave-or-fire-barrier
                                // that will return from the handler.
                                let dest_offset = cache.read_short(frame, 2) as usize;
                                frame.pc += dest_offset;
                                let code_block = ensure_method_code(method)?;
                                let (heap, roots) = runtime.heap_and_roots();
                                push_stack_frame(
                                    heap,
                                    roots,
                                    stack,
                                    frame,
                                    get_code_block_high_water_mark(code_block),
                                    arg_map,
                                )?;
                                frame.set_code_block(code_block);
                                frame.set_argument(0, handler);
                                cache.refresh(frame);
                            }
                        }
                    }
                    Err(c) => return Err(c),
                }
            }
            Opcode::Return => {
                let result = frame.pop_value();
                frame.pop_within_stack_piece();
                cache.refresh(frame);
                frame.push_value(result)?;
            }
            Opcode::StackBottom => {
                let result = frame.pop_value();
                debug_assert!(
                    is_nothing(get_stack_top_barrier(stack)),
                    "leftover barriers"
                );
                return Ok(result);
            }
            Opcode::StackPieceBottom => {
                let top_piece = frame.stack_piece;
                let result = frame.pop_value();
                let next_piece = get_stack_piece_previous(top_piece);
                set_stack_top_piece(stack, next_piece);
                *frame = open_stack(stack);
                cache.refresh(frame);
                frame.push_value(result)?;
            }
            Opcode::Slap => {
                let value = frame.pop_value();
                let count = cache.read_short(frame, 1) as usize;
                for _ in 0..count {
                    frame.pop_value();
                }
                frame.push_value(value)?;
                frame.pc += Opcode::Slap.width();
            }
            Opcode::NewReference => {
                // Create the reference first; if that fails the stack is
                // untouched.
                let (heap, roots) = runtime.heap_and_roots();
                let reference = crate::alloc::new_heap_reference(heap, roots, nothing())?;
                let value = frame.pop_value();
                crate::objects::set_reference_value(reference, value);
                frame.push_value(reference)?;
                frame.pc += Opcode::NewReference.width();
            }
            Opcode::SetReference => {
                let reference = frame.pop_value();
                debug_assert!(species::in_family(Family::Reference, reference));
                let value = frame.peek_value(0);
                crate::objects::set_reference_value(reference, value);
                frame.pc += Opcode::SetReference.width();
            }
            Opcode::GetReference => {
                let reference = frame.pop_value();
                debug_assert!(species::in_family(Family::Reference, reference));
                frame.push_value(crate::objects::get_reference_value(reference))?;
                frame.pc += Opcode::GetReference.width();
            }
            Opcode::LoadLocal => {
                let index = cache.read_short(frame, 1) as usize;
                let value = frame.get_local(index)?;
                frame.push_value(value)?;
                frame.pc += Opcode::LoadLocal.width();
            }
            Opcode::LoadGlobal => {
                let path = cache.read_value(frame, 1);
                debug_assert!(species::in_family(Family::Path, path));
                let fragment = cache.read_value(frame, 2);
                let value = crate::bind::module_fragment_lookup_path_full(fragment, path)?;
                frame.push_value(value)?;
                frame.pc += Opcode::LoadGlobal.width();
            }
            Opcode::LoadArgument => {
                let param_index = cache.read_short(frame, 1) as usize;
                let value = frame.get_argument(param_index);
                frame.push_value(value)?;
                frame.pc += Opcode::LoadArgument.width();
            }
            Opcode::LoadRawArgument => {
                let eval_index = cache.read_short(frame, 1) as usize;
                let value = frame.get_raw_argument(eval_index);
                frame.push_value(value)?;
                frame.pc += Opcode::LoadRawArgument.width();
            }
            Opcode::LoadRefractedArgument => {
                let param_index = cache.read_short(frame, 1) as usize;
                let block_depth = cache.read_short(frame, 2) as usize;
                let subject = frame.get_argument(0);
                let mut home = Frame::empty();
                get_refractor_refracted_frame(subject, block_depth, &mut home);
                frame.push_value(home.get_argument(param_index))?;
                frame.pc += Opcode::LoadRefractedArgument.width();
            }
            Opcode::LoadRefractedLocal => {
                let index = cache.read_short(frame, 1) as usize;
                let block_depth = cache.read_short(frame, 2) as usize;
                let subject = frame.get_argument(0);
                let mut home = Frame::empty();
                get_refractor_refracted_frame(subject, block_depth, &mut home);
                frame.push_value(home.get_local(index)?)?;
                frame.pc += Opcode::LoadRefractedLocal.width();
            }
            Opcode::LoadLambdaCapture => {
                let index = cache.read_short(frame, 1) as usize;
                let subject = frame.get_argument(0);
                debug_assert!(species::in_family(Family::Lambda, subject));
                frame.push_value(get_lambda_capture(subject, index))?;
                frame.pc += Opcode::LoadLambdaCapture.width();
            }
            Opcode::LoadRefractedCapture => {
                let index = cache.read_short(frame, 1) as usize;
                let block_depth = cache.read_short(frame, 2) as usize;
                let subject = frame.get_argument(0);
                let mut home = Frame::empty();
                get_refractor_refracted_frame(subject, block_depth, &mut home);
                let lambda = home.get_argument(0);
                debug_assert!(species::in_family(Family::Lambda, lambda));
                frame.push_value(get_lambda_capture(lambda, index))?;
                frame.pc += Opcode::LoadRefractedCapture.width();
            }
            Opcode::Lambda => {
                let space = cache.read_value(frame, 1);
                debug_assert!(species::in_family(Family::Methodspace, space));
                let capture_count = cache.read_short(frame, 2) as usize;
                let (heap, roots) = runtime.heap_and_roots();
                let lambda = crate::alloc::new_heap_lambda(heap, roots, space, nothing())?;
                let captures = if capture_count == 0 {
                    frame.pc += Opcode::Lambda.width();
                    roots.empty_array()
                } else {
                    let captures = crate::alloc::new_heap_array(heap, roots, capture_count)?;
                    // All allocation is done, so the instruction is now
                    // idempotent and the pops below are guaranteed to land.
                    frame.pc += Opcode::Lambda.width();
                    for i in 0..capture_count {
                        set_array_at(captures, i, frame.pop_value());
                    }
                    captures
                };
                set_lambda_captures(lambda, captures);
                frame.push_value(lambda)?;
            }
            Opcode::CreateBlock => {
                let space = cache.read_value(frame, 1);
                debug_assert!(species::in_family(Family::Methodspace, space));
                let (heap, roots) = runtime.heap_and_roots();
                let block = crate::alloc::new_heap_block(heap, roots, nothing())?;
                let section = frame_alloc_derived_object(
                    frame,
                    get_genus_descriptor(Genus::BlockSection),
                );
                derived::set_barrier_state_payload(section, block);
                refraction_point_init(section, frame);
                derived::set_block_section_methodspace(section, space);
                set_block_section(block, section);
                frame.push_value(block)?;
                frame.pc += Opcode::CreateBlock.width();
            }
            Opcode::CreateEnsurer => {
                let code_block = cache.read_value(frame, 1);
                let section = frame_alloc_derived_object(
                    frame,
                    get_genus_descriptor(Genus::EnsureSection),
                );
                derived::set_barrier_state_payload(section, code_block);
                refraction_point_init(section, frame);
                frame.push_value(section)?;
                frame.pc += Opcode::CreateEnsurer.width();
            }
            Opcode::CallEnsurer => {
                let value = frame.pop_value();
                let shard = frame.pop_value();
                frame.push_value(value)?;
                frame.push_value(shard)?;
                debug_assert!(in_genus(Genus::EnsureSection, shard));
                let code_block = get_barrier_state_payload(shard);
                debug_assert!(species::in_family(Family::CodeBlock, code_block));
                // Unregister before calling; leaving by escape from within
                // the shard must not run it again.
                barrier_state_unregister(shard, stack);
                frame.pc += Opcode::CallEnsurer.width();
                let (heap, roots) = runtime.heap_and_roots();
                let arg_map = roots.array_of_zero();
                push_stack_frame(
                    heap,
                    roots,
                    stack,
                    frame,
                    get_code_block_high_water_mark(code_block),
                    arg_map,
                )?;
                frame.set_code_block(code_block);
                cache.refresh(frame);
            }
            Opcode::DisposeEnsurer => {
                // The shard result is discarded; an ensure that needs to
                // produce a value does it through an escape.
                frame.pop_value();
                let shard = frame.pop_value();
                debug_assert!(in_genus(Genus::EnsureSection, shard));
                let value = frame.pop_value();
                frame_destroy_derived_object(frame, get_genus_descriptor(Genus::EnsureSection));
                frame.push_value(value)?;
                frame.pc += Opcode::DisposeEnsurer.width();
            }
            Opcode::InstallSignalHandler => {
                let space = cache.read_value(frame, 1);
                debug_assert!(species::in_family(Family::Methodspace, space));
                let dest_offset = cache.read_short(frame, 2) as usize;
                let section = frame_alloc_derived_object(
                    frame,
                    get_genus_descriptor(Genus::SignalHandlerSection),
                );
                derived::set_barrier_state_payload(section, space);
                refraction_point_init(section, frame);
                frame.push_value(section)?;
                frame.pc += Opcode::InstallSignalHandler.width();
                capture_escape_state(section, frame, dest_offset);
            }
            Opcode::UninstallSignalHandler => {
                let value = frame.pop_value();
                let section = frame.pop_value();
                debug_assert!(in_genus(Genus::SignalHandlerSection, section));
                barrier_state_unregister(section, stack);
                frame_destroy_derived_object(
                    frame,
                    get_genus_descriptor(Genus::SignalHandlerSection),
                );
                frame.push_value(value)?;
                frame.pc += Opcode::UninstallSignalHandler.width();
            }
            Opcode::CreateEscape => {
                let dest_offset = cache.read_short(frame, 1) as usize;
                let (heap, roots) = runtime.heap_and_roots();
                let escape = crate::alloc::new_heap_escape(heap, roots, nothing())?;
                let section = frame_alloc_derived_object(
                    frame,
                    get_genus_descriptor(Genus::EscapeSection),
                );
                derived::set_barrier_state_payload(section, escape);
                refraction_point_init(section, frame);
                set_escape_section(escape, section);
                frame.push_value(escape)?;
                frame.pc += Opcode::CreateEscape.width();
                // This state, biased by the destination offset, is where the
                // escape lands.
                capture_escape_state(section, frame, dest_offset);
            }
            Opcode::LeaveOrFireBarrier => {
                let argc = cache.read_short(frame, 1) as usize;
                // The handler section was installed as the subject of the
                // handler method call; above it sit the arguments plus two
                // scratch entries.
                let handler = frame.peek_value(argc + 2);
                debug_assert!(in_genus(Genus::SignalHandlerSection, handler));
                if maybe_fire_next_barrier(runtime, cache, frame, stack, handler)? {
                    // Arrived: pop the scratch entries and the value, then
                    // escape to the handler's home.
                    frame.pop_value();
                    frame.pop_value();
                    let value = frame.pop_value();
                    restore_escape_state(frame, stack, handler);
                    cache.refresh(frame);
                    frame.push_value(value)?;
                } else {
                    // A barrier fired; let the loop come around again
                    // without touching the pc.
                }
            }
            Opcode::FireEscapeOrBarrier => {
                let escape = frame.get_argument(0);
                debug_assert!(species::in_family(Family::Escape, escape));
                let section = get_escape_section(escape);
                if maybe_fire_next_barrier(runtime, cache, frame, stack, section)? {
                    let value = frame.get_argument(2);
                    restore_escape_state(frame, stack, section);
                    cache.refresh(frame);
                    frame.push_value(value)?;
                }
            }
            Opcode::DisposeEscape => {
                let value = frame.pop_value();
                let escape = frame.pop_value();
                debug_assert!(species::in_family(Family::Escape, escape));
                let section = get_escape_section(escape);
                barrier_state_unregister(section, stack);
                set_escape_section(escape, nothing());
                frame_destroy_derived_object(frame, get_genus_descriptor(Genus::EscapeSection));
                frame.push_value(value)?;
                frame.pc += Opcode::DisposeEscape.width();
            }
            Opcode::DisposeBlock => {
                let value = frame.pop_value();
                let block = frame.pop_value();
                debug_assert!(species::in_family(Family::Block, block));
                let section = crate::closures::get_block_section(block);
                barrier_state_unregister(section, stack);
                set_block_section(block, nothing());
                frame_destroy_derived_object(frame, get_genus_descriptor(Genus::BlockSection));
                frame.push_value(value)?;
                frame.pc += Opcode::DisposeBlock.width();
            }
            Opcode::CreateCallData => {
                let argc = cache.read_short(frame, 1) as usize;
                let (heap, roots) = runtime.heap_and_roots();
                let raw_tags = crate::alloc::new_heap_array(heap, roots, argc)?;
                for i in 0..argc {
                    let tag = frame.peek_value(2 * (argc - i) - 1);
                    set_array_at(raw_tags, i, tag);
                }
                let entries = crate::method::build_call_tags_entries(heap, roots, raw_tags)?;
                let call_tags = crate::alloc::new_heap_call_tags(heap, roots, entries)?;
                species::ensure_frozen(runtime, call_tags)?;
                // Reuse the tag array for the values.
                let values = raw_tags;
                for i in 0..argc {
                    let value = frame.pop_value();
                    frame.pop_value();
                    set_array_at(values, i, value);
                }
                let (heap, roots) = runtime.heap_and_roots();
                let call_data = crate::alloc::new_heap_call_data(heap, roots, call_tags, values)?;
                frame.push_value(call_data)?;
                frame.pc += Opcode::CreateCallData.width();
            }
            Opcode::ModuleFragmentPrivateInvoke => {
                let private = frame.get_argument(0);
                debug_assert!(species::in_family(Family::ModuleFragmentPrivate, private));
                let fragment = crate::bind::get_module_fragment_private_owner(private);
                let call_data = frame.get_argument(2);
                debug_assert!(species::in_family(Family::CallData, call_data));
                let (method, arg_map) = {
                    let input = SigmapInput::CallData { call_data };
                    let (heap, roots) = runtime.heap_and_roots();
                    match lookup_method_full(heap, roots, &input, ambience, fragment) {
                        Err(c) if c.cause() == ConditionCause::LookupError => {
                            log_lookup_error(c, &input);
                            return Err(c);
                        }
                        other => other?,
                    }
                };
                let code_block = ensure_method_code(method)?;
                frame.pc += Opcode::ModuleFragmentPrivateInvoke.width();
                // Build the synthetic frame holding the reified arguments.
                let values = crate::method::get_call_data_values(call_data);
                let argc = crate::objects::get_array_length(values);
                let (heap, roots) = runtime.heap_and_roots();
                push_stack_frame(heap, roots, stack, frame, argc + 1, nothing())?;
                frame.set_code_block(runtime.roots.return_code_block());
                for i in 0..argc {
                    frame.push_value(get_array_at(values, argc - i - 1))?;
                }
                // Then the method's own frame on top.
                let (heap, roots) = runtime.heap_and_roots();
                push_stack_frame(
                    heap,
                    roots,
                    stack,
                    frame,
                    get_code_block_high_water_mark(code_block),
                    arg_map,
                )?;
                frame.set_code_block(code_block);
                cache.refresh(frame);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Backtraces
// ---------------------------------------------------------------------------

fn is_invocation_opcode(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Invoke
            | Opcode::SignalEscape
            | Opcode::SignalContinue
            | Opcode::BuiltinMaybeEscape
            | Opcode::CallEnsurer
    )
}

/// Captures one backtrace entry if the frame's pc sits just past an
/// invocation instruction; nothing otherwise.
fn capture_backtrace_entry(runtime: &mut Runtime, frame: &mut Frame) -> Result<Value, Condition> {
    let code_block = frame.get_code_block();
    if is_nothing(code_block) {
        return Ok(nothing());
    }
    let pc = frame.pc;
    if pc < Opcode::Invoke.width() {
        return Ok(nothing());
    }
    let raw = crate::bytecode::code_block_short_at(code_block, pc - Opcode::Invoke.width());
    let opcode = match Opcode::from_raw(raw) {
        Some(opcode) if is_invocation_opcode(opcode) => opcode,
        _ => return Ok(nothing()),
    };
    let tags;
    if opcode == Opcode::CallEnsurer {
        let (heap, roots) = runtime.heap_and_roots();
        return crate::alloc::new_heap_backtrace_entry(
            heap,
            roots,
            nothing(),
            Value::new_integer(opcode as i64),
        );
    } else if opcode == Opcode::BuiltinMaybeEscape {
        // A builtin escape leaves the record on the stack; popping it here
        // only changes the local frame copy.
        tags = frame.pop_value();
    } else {
        let record_index =
            crate::bytecode::code_block_short_at(code_block, pc - Opcode::Invoke.width() + 1);
        let value_pool = get_code_block_value_pool(code_block);
        tags = get_array_at(value_pool, record_index as usize);
    }
    let (heap, roots) = runtime.heap_and_roots();
    let invocation = crate::alloc::new_heap_id_hash_map(heap, roots, 16)?;
    let arg_count = crate::method::get_call_tags_entry_count(tags);
    for i in 0..arg_count {
        let tag = crate::method::get_call_tags_tag_at(tags, i);
        let arg = frame.get_pending_argument_at(tags, i);
        maps::set_id_hash_map_at(heap, roots, invocation, tag, arg)?;
    }
    crate::alloc::new_heap_backtrace_entry(heap, roots, invocation, Value::new_integer(opcode as i64))
}

/// Walks the frames from the top, capturing an entry per invocation frame.
pub fn capture_backtrace(runtime: &mut Runtime, top: &Frame) -> Result<Value, Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let frames = crate::alloc::new_heap_array_buffer(heap, roots, 16)?;
    let mut iter = FrameIter::from_frame(top);
    loop {
        let mut current = *iter.current();
        let entry = capture_backtrace_entry(runtime, &mut current)?;
        if !is_nothing(entry) {
            let (heap, roots) = runtime.heap_and_roots();
            crate::objects::add_to_array_buffer(heap, roots, frames, entry)?;
        }
        if !iter.advance() {
            break;
        }
    }
    let (heap, roots) = runtime.heap_and_roots();
    crate::alloc::new_heap_backtrace(heap, roots, frames)
}

/// Renders a backtrace entry: "leave" for escapes, "signal" for continuable
/// signals, "ensure" for ensure shards, otherwise the invocation with its
/// selector printed in operation form.
pub fn backtrace_entry_print_on(entry: Value, context: &mut PrintContext) {
    let opcode = get_backtrace_entry_opcode(entry);
    if opcode == Opcode::CallEnsurer {
        context.buf.push_str("ensure");
        return;
    }
    let invocation = get_backtrace_entry_invocation(entry);
    let mut subject = None;
    let mut selector = None;
    for (key, value) in maps::IdHashMapIter::new(invocation) {
        if species::in_family(Family::Key, key) {
            match crate::objects::get_key_id(key) {
                0 => subject = Some(value),
                1 => selector = Some(value),
                _ => {}
            }
        }
    }
    if opcode == Opcode::SignalEscape || opcode == Opcode::BuiltinMaybeEscape {
        context.buf.push_str("leave");
    } else if opcode == Opcode::SignalContinue {
        context.buf.push_str("signal");
    } else if let Some(subject) = subject {
        species::value_print_on(subject, context);
    }
    let selector_is_operation =
        selector.map(|s| species::in_family(Family::Operation, s)).unwrap_or(false);
    if let Some(selector) = selector {
        if selector_is_operation {
            crate::objects::print_operation_open(selector, context);
        } else {
            species::value_print_on(selector, context);
        }
    }
    // Positional arguments, in order.
    let mut positional = 0;
    let mut printed = 0;
    loop {
        match maps::get_id_hash_map_at(invocation, Value::new_integer(positional)) {
            Ok(value) => {
                if printed > 0 {
                    context.buf.push_str(", ");
                }
                species::value_print_on(value, context);
                positional += 1;
                printed += 1;
            }
            Err(_) => break,
        }
    }
    // Any remaining keyword arguments.
    for (key, value) in maps::IdHashMapIter::new(invocation) {
        if species::in_family(Family::Key, key) {
            let id = crate::objects::get_key_id(key);
            if id == 0 || id == 1 {
                continue;
            }
        } else if key.is_integer() && key.as_integer() >= 0 && key.as_integer() < positional {
            continue;
        }
        if printed > 0 {
            context.buf.push_str(", ");
        }
        species::value_print_on(key, context);
        context.buf.push_str(": ");
        species::value_print_on(value, context);
        printed += 1;
    }
    if let Some(selector) = selector {
        if selector_is_operation {
            crate::objects::print_operation_close(selector, context);
        }
    }
}

pub fn backtrace_to_string(backtrace: Value) -> String {
    let mut context = PrintContext::new();
    context.buf.push_str("--- backtrace ---");
    let entries = get_backtrace_entries(backtrace);
    for i in 0..crate::objects::get_array_buffer_length(entries) {
        context.buf.push_str("\n- ");
        backtrace_entry_print_on(crate::objects::get_array_buffer_at(entries, i), &mut context);
    }
    context.buf
}

// ---------------------------------------------------------------------------
// Outer loops: conditions, collection, validation
// ---------------------------------------------------------------------------

/// Runs the task; if it ends in an escaped signal, captures and records the
/// backtrace before passing the condition on.
pub fn run_task_until_condition(
    runtime: &mut Runtime,
    ambience: Value,
    task: Value,
) -> Result<Value, Condition> {
    let result = run_task_pushing_signals(runtime, ambience, task);
    if let Err(c) = &result {
        if c.cause() == ConditionCause::Signal {
            let frame = open_stack(get_task_stack(task));
            let rendered = match capture_backtrace(runtime, &frame) {
                Ok(backtrace) => backtrace_to_string(backtrace),
                Err(_) => String::from("--- backtrace unavailable ---"),
            };
            let mut frame = frame;
            close_frame(&mut frame);
            error!("{}", rendered);
            runtime.last_backtrace = Some(rendered);
        }
    }
    result
}

/// Runs the task to completion or an escaped signal, recovering from heap
/// exhaustion by collecting and from validation interrupts by validating.
pub fn run_task_until_signal(
    runtime: &mut Runtime,
    s_ambience: SafeValue,
    s_task: SafeValue,
) -> Result<Value, Condition> {
    loop {
        let ambience = s_ambience.deref();
        let task = s_task.deref();
        match run_task_until_condition(runtime, ambience, task) {
            Err(c) if c.cause() == ConditionCause::HeapExhausted => {
                runtime.garbage_collect()?;
            }
            Err(c) if c.cause() == ConditionCause::ForceValidate => {
                runtime.validate_heap()?;
            }
            other => return other,
        }
    }
}

/// Sets up the stack of a fresh task to run a job: a synthetic frame that
/// holds the job data and returns by itself, then the job code's frame.
pub fn prepare_run_job(runtime: &mut Runtime, stack: Value, job: &Job) -> Result<(), Condition> {
    let mut frame = open_stack(stack);
    let result = (|| {
        let (heap, roots) = runtime.heap_and_roots();
        push_stack_frame(heap, roots, stack, &mut frame, 2, roots.empty_array())?;
        frame.set_code_block(roots.return_code_block());
        frame.push_value(job.data)?;
        let frame_size = get_code_block_high_water_mark(job.code);
        let (heap, roots) = runtime.heap_and_roots();
        push_stack_frame(heap, roots, stack, &mut frame, frame_size, roots.empty_array())?;
        frame.set_code_block(job.code);
        Ok(())
    })();
    close_frame(&mut frame);
    result
}

fn resolve_job_promise(result: Value, job: &Job) {
    if !is_nothing(job.promise) {
        fulfill_promise(job.promise, result);
    }
}

/// Takes the next ready job from the process and runs it on the root task.
pub fn run_next_process_job(
    runtime: &mut Runtime,
    s_ambience: SafeValue,
    s_process: SafeValue,
) -> Result<Value, Condition> {
    let job = take_process_job(s_process.deref())?;
    let task = get_process_root_task(s_process.deref());
    let s_task = runtime.protect(task);
    let result = (|| {
        prepare_run_job(runtime, get_task_stack(s_task.deref()), &job)?;
        let result = run_task_until_signal(runtime, s_ambience, s_task)?;
        resolve_job_promise(result, &job);
        Ok(result)
    })();
    runtime.unprotect(s_task);
    result
}

/// Runs jobs until the process is idle, draining delivered I/O between
/// jobs. The last job's value is the result.
pub fn run_process_until_idle(
    runtime: &mut Runtime,
    s_ambience: SafeValue,
    s_process: SafeValue,
) -> Result<Value, Condition> {
    let mut result = crate::core::tagged::null();
    loop {
        crate::process::deliver_pending_io(runtime, s_process.deref())?;
        if is_process_idle(s_process.deref()) {
            return Ok(result);
        }
        if crate::maps::get_fifo_buffer_size(crate::process::get_process_work_queue(
            s_process.deref(),
        )) > 0
        {
            result = run_next_process_job(runtime, s_ambience, s_process)?;
        } else {
            // No runnable job but open requests remain: block until the
            // engine delivers something.
            crate::process::wait_for_airlock_delivery(runtime, s_process.deref());
        }
    }
}

/// The toplevel entry point: wraps the code in a bootstrap job on a fresh
/// process and runs the process until idle.
pub fn run_code_block(
    runtime: &mut Runtime,
    ambience: Value,
    code: Value,
) -> Result<Value, Condition> {
    let process = crate::process::new_heap_process(runtime)?;
    let s_process = runtime.protect(process);
    let s_ambience = runtime.protect(ambience);
    let result = (|| {
        let job = Job { code, data: nothing(), promise: nothing(), guard: nothing() };
        crate::process::offer_process_job(runtime, s_process.deref(), &job)?;
        run_process_until_idle(runtime, s_ambience, s_process)
    })();
    runtime.unprotect(s_ambience);
    runtime.unprotect(s_process);
    result
}
