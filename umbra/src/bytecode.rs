/// Bytecode Instruction Set — Variable-Width 16-bit Shorts
///
/// INSTRUCTION FORMAT
/// ──────────────────
/// A code block holds a blob of little-endian 16-bit shorts plus a value
/// pool. An instruction is an opcode short followed by operand shorts; the
/// width of every opcode is fixed and known statically. Operands that name
/// values are indexes into the value pool.
///
/// The interpreter advances the pc by the instruction width unless the
/// opcode itself transfers control (Goto, Return, the escape family, the
/// cross-piece returns).
///
/// The assembler at the bottom mirrors how code is produced: emit shorts,
/// intern pool values, track the operand-stack high-water mark that sizes
/// frames, back-patch forward gotos, then flush to a heap code block.

use std::fmt::Write;

use crate::core::value::{Condition, Value};
use crate::heap::{get_heap_object_field, heap_object_field_offset, set_heap_object_field, Heap};
use crate::objects::{get_blob_short_at, get_array_length};
use crate::runtime::{Roots, Runtime};
use crate::species::{self, Family, PrintContext};

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Builtin                     = 0,  // wrapper             → push native result
    BuiltinMaybeEscape          = 1,  // wrapper, dest, _    → native that may signal
    CallEnsurer                 = 2,  // _, _, _             → run ensure shard
    CheckStackHeight            = 3,  // height              → assert operand depth
    CreateBlock                 = 4,  // space               → block + section barrier
    CreateCallData              = 5,  // argc                → reify tag/value pairs
    CreateEnsurer               = 6,  // code                → ensure section barrier
    CreateEscape                = 7,  // dest                → escape + captured state
    DelegateToLambda            = 8,  //                     → consumed by lookup
    DelegateToBlock             = 9,  //                     → consumed by lookup
    DisposeBlock                = 10, //                     → dissolve block section
    DisposeEnsurer              = 11, //                     → dissolve ensure section
    DisposeEscape               = 12, //                     → dissolve escape section
    FireEscapeOrBarrier         = 13, //                     → escape one barrier at a time
    GetReference                = 14, //                     → read through reference
    Goto                        = 15, // delta               → pc += delta
    InstallSignalHandler        = 16, // space, dest         → handler section barrier
    UninstallSignalHandler      = 17, //                     → unhook handler section
    Invoke                      = 18, // tags, fragment, _   → method dispatch
    Lambda                      = 19, // space, capturec     → close over captures
    LeaveOrFireBarrier          = 20, // argc                → leave handler to its home
    LoadArgument                = 21, // param               → push argument via map
    LoadGlobal                  = 22, // path, fragment      → namespace lookup
    LoadLocal                   = 23, // index               → push local slot
    LoadLambdaCapture           = 24, // index               → push subject capture
    LoadRawArgument             = 25, // eval index          → push argument pre-map
    LoadRefractedArgument       = 26, // param, depth        → outer frame argument
    LoadRefractedCapture        = 27, // index, depth        → outer lambda capture
    LoadRefractedLocal          = 28, // index, depth        → outer frame local
    ModuleFragmentPrivateInvoke = 29, //                     → lookup through private
    NewArray                    = 30, // length              → pop n into array
    NewReference                = 31, //                     → wrap top in reference
    Pop                         = 32, // count               → pop n values
    Push                        = 33, // value               → push pool value
    Return                      = 34, //                     → pop frame, push result
    SetReference                = 35, //                     → write through reference
    SignalEscape                = 36, // tags, _, _          → raise, escape if unhandled
    SignalContinue              = 37, // tags, _, _          → raise, default if unhandled
    Slap                        = 38, // count               → pop n below the top
    StackBottom                 = 39, //                     → final return from root
    StackPieceBottom            = 40, //                     → return across pieces
}

pub const OPCODE_COUNT: usize = 41;

impl Opcode {
    pub fn from_raw(raw: u16) -> Option<Opcode> {
        if (raw as usize) < OPCODE_COUNT {
            Some(unsafe { std::mem::transmute(raw) })
        } else {
            None
        }
    }

    /// Instruction width in shorts, the opcode itself included.
    pub fn width(self) -> usize {
        match self {
            Opcode::Builtin                     => 2,
            Opcode::BuiltinMaybeEscape          => 4,
            Opcode::CallEnsurer                 => 4,
            Opcode::CheckStackHeight            => 2,
            Opcode::CreateBlock                 => 2,
            Opcode::CreateCallData              => 2,
            Opcode::CreateEnsurer               => 2,
            Opcode::CreateEscape                => 2,
            Opcode::DelegateToLambda            => 1,
            Opcode::DelegateToBlock             => 1,
            Opcode::DisposeBlock                => 1,
            Opcode::DisposeEnsurer              => 1,
            Opcode::DisposeEscape               => 1,
            Opcode::FireEscapeOrBarrier         => 1,
            Opcode::GetReference                => 1,
            Opcode::Goto                        => 2,
            Opcode::InstallSignalHandler        => 3,
            Opcode::UninstallSignalHandler      => 1,
            Opcode::Invoke                      => 4,
            Opcode::Lambda                      => 3,
            Opcode::LeaveOrFireBarrier          => 2,
            Opcode::LoadArgument                => 2,
            Opcode::LoadGlobal                  => 3,
            Opcode::LoadLocal                   => 2,
            Opcode::LoadLambdaCapture           => 2,
            Opcode::LoadRawArgument             => 2,
            Opcode::LoadRefractedArgument       => 3,
            Opcode::LoadRefractedCapture        => 3,
            Opcode::LoadRefractedLocal          => 3,
            Opcode::ModuleFragmentPrivateInvoke => 1,
            Opcode::NewArray                    => 2,
            Opcode::NewReference                => 1,
            Opcode::Pop                         => 2,
            Opcode::Push                        => 2,
            Opcode::Return                      => 1,
            Opcode::SetReference                => 1,
            Opcode::SignalEscape                => 4,
            Opcode::SignalContinue              => 4,
            Opcode::Slap                        => 2,
            Opcode::StackBottom                 => 1,
            Opcode::StackPieceBottom            => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Builtin => "Builtin",
            Opcode::BuiltinMaybeEscape => "BuiltinMaybeEscape",
            Opcode::CallEnsurer => "CallEnsurer",
            Opcode::CheckStackHeight => "CheckStackHeight",
            Opcode::CreateBlock => "CreateBlock",
            Opcode::CreateCallData => "CreateCallData",
            Opcode::CreateEnsurer => "CreateEnsurer",
            Opcode::CreateEscape => "CreateEscape",
            Opcode::DelegateToLambda => "DelegateToLambda",
            Opcode::DelegateToBlock => "DelegateToBlock",
            Opcode::DisposeBlock => "DisposeBlock",
            Opcode::DisposeEnsurer => "DisposeEnsurer",
            Opcode::DisposeEscape => "DisposeEscape",
            Opcode::FireEscapeOrBarrier => "FireEscapeOrBarrier",
            Opcode::GetReference => "GetReference",
            Opcode::Goto => "Goto",
            Opcode::InstallSignalHandler => "InstallSignalHandler",
            Opcode::UninstallSignalHandler => "UninstallSignalHandler",
            Opcode::Invoke => "Invoke",
            Opcode::Lambda => "Lambda",
            Opcode::LeaveOrFireBarrier => "LeaveOrFireBarrier",
            Opcode::LoadArgument => "LoadArgument",
            Opcode::LoadGlobal => "LoadGlobal",
            Opcode::LoadLocal => "LoadLocal",
            Opcode::LoadLambdaCapture => "LoadLambdaCapture",
            Opcode::LoadRawArgument => "LoadRawArgument",
            Opcode::LoadRefractedArgument => "LoadRefractedArgument",
            Opcode::LoadRefractedCapture => "LoadRefractedCapture",
            Opcode::LoadRefractedLocal => "LoadRefractedLocal",
            Opcode::ModuleFragmentPrivateInvoke => "ModuleFragmentPrivateInvoke",
            Opcode::NewArray => "NewArray",
            Opcode::NewReference => "NewReference",
            Opcode::Pop => "Pop",
            Opcode::Push => "Push",
            Opcode::Return => "Return",
            Opcode::SetReference => "SetReference",
            Opcode::SignalEscape => "SignalEscape",
            Opcode::SignalContinue => "SignalContinue",
            Opcode::Slap => "Slap",
            Opcode::StackBottom => "StackBottom",
            Opcode::StackPieceBottom => "StackPieceBottom",
        }
    }
}

// ---------------------------------------------------------------------------
// CodeBlock
// ---------------------------------------------------------------------------

pub const CODE_BLOCK_BYTECODE_OFFSET: usize = heap_object_field_offset(0);
pub const CODE_BLOCK_VALUE_POOL_OFFSET: usize = heap_object_field_offset(1);
pub const CODE_BLOCK_HIGH_WATER_MARK_OFFSET: usize = heap_object_field_offset(2);
pub const CODE_BLOCK_FIELD_COUNT: usize = 3;

pub fn get_code_block_bytecode(code_block: Value) -> Value {
    get_heap_object_field(code_block, CODE_BLOCK_BYTECODE_OFFSET)
}

pub fn get_code_block_value_pool(code_block: Value) -> Value {
    get_heap_object_field(code_block, CODE_BLOCK_VALUE_POOL_OFFSET)
}

/// The deepest the operand stack can grow while this code runs; sizes the
/// frame pushed for it.
pub fn get_code_block_high_water_mark(code_block: Value) -> usize {
    get_heap_object_field(code_block, CODE_BLOCK_HIGH_WATER_MARK_OFFSET).as_integer() as usize
}

pub fn set_code_block_high_water_mark(code_block: Value, mark: usize) {
    set_heap_object_field(
        code_block,
        CODE_BLOCK_HIGH_WATER_MARK_OFFSET,
        Value::new_integer(mark as i64),
    );
}

pub fn code_block_validate(code_block: Value) -> Result<(), Condition> {
    if !species::in_family(Family::Blob, get_code_block_bytecode(code_block)) {
        return Err(Condition::validation_failed());
    }
    if !species::in_family(Family::Array, get_code_block_value_pool(code_block)) {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

pub fn code_block_print_on(code_block: Value, context: &mut PrintContext) {
    let _ = write!(
        context.buf,
        "#<code block: hwm@{}, pool@{}>",
        get_code_block_high_water_mark(code_block),
        get_array_length(get_code_block_value_pool(code_block)),
    );
}

pub fn ensure_code_block_owned_values_frozen(
    runtime: &mut Runtime,
    code_block: Value,
) -> Result<(), Condition> {
    species::ensure_frozen(runtime, get_code_block_value_pool(code_block))
}

/// Reads the short at the given short index of a code block's bytecode.
pub fn code_block_short_at(code_block: Value, index: usize) -> u16 {
    get_blob_short_at(get_code_block_bytecode(code_block), index)
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

/// Accumulates shorts and pool values, then flushes into a heap code block.
/// Stack heights are tracked per emit so the high-water mark falls out of
/// assembly; Invoke sites must declare how many slots the callee consumes.
pub struct Assembler {
    shorts: Vec<u16>,
    pool: Vec<Value>,
    stack_height: usize,
    high_water_mark: usize,
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler { shorts: Vec::new(), pool: Vec::new(), stack_height: 0, high_water_mark: 0 }
    }

    pub fn pc(&self) -> usize {
        self.shorts.len()
    }

    pub fn stack_height(&self) -> usize {
        self.stack_height
    }

    fn adjust(&mut self, pushed: usize, popped: usize) {
        debug_assert!(self.stack_height >= popped, "operand stack underflow in assembly");
        self.stack_height = self.stack_height - popped + pushed;
        self.high_water_mark = self.high_water_mark.max(self.stack_height);
    }

    /// Interns a value in the pool by identity, returning its index.
    fn intern(&mut self, value: Value) -> u16 {
        for (i, &existing) in self.pool.iter().enumerate() {
            if existing == value {
                return i as u16;
            }
        }
        self.pool.push(value);
        (self.pool.len() - 1) as u16
    }

    fn emit(&mut self, opcode: Opcode, operands: &[u16]) {
        debug_assert_eq!(operands.len() + 1, opcode.width());
        self.shorts.push(opcode as u16);
        self.shorts.extend_from_slice(operands);
    }

    // ── Stack and literals ───────────────────────────────────────────────────

    pub fn emit_push(&mut self, value: Value) {
        let index = self.intern(value);
        self.emit(Opcode::Push, &[index]);
        self.adjust(1, 0);
    }

    pub fn emit_pop(&mut self, count: usize) {
        self.emit(Opcode::Pop, &[count as u16]);
        self.adjust(0, count);
    }

    pub fn emit_slap(&mut self, count: usize) {
        self.emit(Opcode::Slap, &[count as u16]);
        self.adjust(0, count);
    }

    pub fn emit_check_stack_height(&mut self) {
        let height = self.stack_height as u16;
        self.emit(Opcode::CheckStackHeight, &[height]);
    }

    pub fn emit_new_array(&mut self, length: usize) {
        self.emit(Opcode::NewArray, &[length as u16]);
        self.adjust(1, length);
    }

    pub fn emit_new_reference(&mut self) {
        self.emit(Opcode::NewReference, &[]);
    }

    pub fn emit_get_reference(&mut self) {
        self.emit(Opcode::GetReference, &[]);
    }

    pub fn emit_set_reference(&mut self) {
        self.emit(Opcode::SetReference, &[]);
        self.adjust(0, 1);
    }

    pub fn emit_create_call_data(&mut self, argc: usize) {
        self.emit(Opcode::CreateCallData, &[argc as u16]);
        self.adjust(1, argc * 2);
    }

    // ── Variables ────────────────────────────────────────────────────────────

    pub fn emit_load_local(&mut self, index: usize) {
        self.emit(Opcode::LoadLocal, &[index as u16]);
        self.adjust(1, 0);
    }

    pub fn emit_load_argument(&mut self, param_index: usize) {
        self.emit(Opcode::LoadArgument, &[param_index as u16]);
        self.adjust(1, 0);
    }

    pub fn emit_load_raw_argument(&mut self, eval_index: usize) {
        self.emit(Opcode::LoadRawArgument, &[eval_index as u16]);
        self.adjust(1, 0);
    }

    pub fn emit_load_global(&mut self, path: Value, fragment: Value) {
        let path_index = self.intern(path);
        let fragment_index = self.intern(fragment);
        self.emit(Opcode::LoadGlobal, &[path_index, fragment_index]);
        self.adjust(1, 0);
    }

    pub fn emit_load_refracted_argument(&mut self, param_index: usize, block_depth: usize) {
        self.emit(Opcode::LoadRefractedArgument, &[param_index as u16, block_depth as u16]);
        self.adjust(1, 0);
    }

    pub fn emit_load_refracted_local(&mut self, index: usize, block_depth: usize) {
        self.emit(Opcode::LoadRefractedLocal, &[index as u16, block_depth as u16]);
        self.adjust(1, 0);
    }

    pub fn emit_load_lambda_capture(&mut self, index: usize) {
        self.emit(Opcode::LoadLambdaCapture, &[index as u16]);
        self.adjust(1, 0);
    }

    pub fn emit_load_refracted_capture(&mut self, index: usize, block_depth: usize) {
        self.emit(Opcode::LoadRefractedCapture, &[index as u16, block_depth as u16]);
        self.adjust(1, 0);
    }

    // ── Calls and signals ────────────────────────────────────────────────────

    /// The pending arguments stay on the stack across the call; the result
    /// lands on top and a following Slap drops the arguments.
    pub fn emit_invoke(&mut self, tags: Value, fragment: Value) {
        let tags_index = self.intern(tags);
        let fragment_index = self.intern(fragment);
        self.emit(Opcode::Invoke, &[tags_index, fragment_index, 0]);
        self.adjust(1, 0);
    }

    pub fn emit_signal_escape(&mut self, tags: Value) {
        let tags_index = self.intern(tags);
        self.emit(Opcode::SignalEscape, &[tags_index, 0, 0]);
        self.adjust(1, 0);
    }

    pub fn emit_signal_continue(&mut self, tags: Value) {
        let tags_index = self.intern(tags);
        self.emit(Opcode::SignalContinue, &[tags_index, 0, 0]);
        self.adjust(1, 0);
    }

    pub fn emit_module_fragment_private_invoke(&mut self) {
        self.emit(Opcode::ModuleFragmentPrivateInvoke, &[]);
        self.adjust(1, 0);
    }

    pub fn emit_delegate_to_lambda(&mut self) {
        self.emit(Opcode::DelegateToLambda, &[]);
    }

    pub fn emit_delegate_to_block(&mut self) {
        self.emit(Opcode::DelegateToBlock, &[]);
    }

    pub fn emit_builtin(&mut self, wrapper: Value, argc: usize) {
        let index = self.intern(wrapper);
        self.emit(Opcode::Builtin, &[index]);
        self.adjust(1, argc);
    }

    pub fn emit_builtin_maybe_escape(&mut self, wrapper: Value, dest_offset: usize) {
        let index = self.intern(wrapper);
        self.emit(Opcode::BuiltinMaybeEscape, &[index, dest_offset as u16, 0]);
        self.adjust(1, 0);
    }

    // ── Closures, escapes, ensure, handlers ──────────────────────────────────

    pub fn emit_lambda(&mut self, space: Value, capture_count: usize) {
        let space_index = self.intern(space);
        self.emit(Opcode::Lambda, &[space_index, capture_count as u16]);
        self.adjust(1, capture_count);
    }

    pub fn emit_create_block(&mut self, space: Value) {
        let space_index = self.intern(space);
        self.emit(Opcode::CreateBlock, &[space_index]);
        // The section plus the block handle land on the stack.
        let section_slots = crate::derived::get_genus_descriptor(
            crate::derived::Genus::BlockSection,
        )
        .field_count();
        self.adjust(section_slots + 1, 0);
    }

    pub fn emit_dispose_block(&mut self) {
        self.emit(Opcode::DisposeBlock, &[]);
        let section_slots = crate::derived::get_genus_descriptor(
            crate::derived::Genus::BlockSection,
        )
        .field_count();
        self.adjust(0, section_slots + 1);
    }

    /// Returns the instruction's pc so the destination can be patched once
    /// the join point is known.
    pub fn emit_create_escape(&mut self, dest_offset: usize) -> usize {
        let at = self.pc();
        self.emit(Opcode::CreateEscape, &[dest_offset as u16]);
        let section_slots = crate::derived::get_genus_descriptor(
            crate::derived::Genus::EscapeSection,
        )
        .field_count();
        self.adjust(section_slots + 1, 0);
        at
    }

    pub fn emit_fire_escape_or_barrier(&mut self) {
        self.emit(Opcode::FireEscapeOrBarrier, &[]);
    }

    pub fn emit_dispose_escape(&mut self) {
        self.emit(Opcode::DisposeEscape, &[]);
        let section_slots = crate::derived::get_genus_descriptor(
            crate::derived::Genus::EscapeSection,
        )
        .field_count();
        self.adjust(0, section_slots + 1);
    }

    pub fn emit_create_ensurer(&mut self, code_block: Value) {
        let index = self.intern(code_block);
        self.emit(Opcode::CreateEnsurer, &[index]);
        // The section slots plus the section value pushed on top of them.
        let section_slots = crate::derived::get_genus_descriptor(
            crate::derived::Genus::EnsureSection,
        )
        .field_count();
        self.adjust(section_slots + 1, 0);
    }

    pub fn emit_call_ensurer(&mut self) {
        self.emit(Opcode::CallEnsurer, &[0, 0, 0]);
        self.adjust(1, 0);
    }

    /// Pops the shard result, the section value, the body value and the
    /// section slots, leaving just the body value.
    pub fn emit_dispose_ensurer(&mut self) {
        self.emit(Opcode::DisposeEnsurer, &[]);
        let section_slots = crate::derived::get_genus_descriptor(
            crate::derived::Genus::EnsureSection,
        )
        .field_count();
        self.adjust(1, section_slots + 3);
    }

    /// Returns the instruction's pc for destination patching.
    pub fn emit_install_signal_handler(&mut self, space: Value, dest_offset: usize) -> usize {
        let at = self.pc();
        let space_index = self.intern(space);
        self.emit(Opcode::InstallSignalHandler, &[space_index, dest_offset as u16]);
        let section_slots = crate::derived::get_genus_descriptor(
            crate::derived::Genus::SignalHandlerSection,
        )
        .field_count();
        self.adjust(section_slots + 1, 0);
        at
    }

    /// Rewrites one operand of an already emitted instruction; used to bind
    /// escape and handler destinations to a later join point.
    pub fn patch_operand(&mut self, instruction_pc: usize, operand: usize, value: u16) {
        self.shorts[instruction_pc + 1 + operand] = value;
    }

    pub fn emit_uninstall_signal_handler(&mut self) {
        self.emit(Opcode::UninstallSignalHandler, &[]);
        let section_slots = crate::derived::get_genus_descriptor(
            crate::derived::Genus::SignalHandlerSection,
        )
        .field_count();
        self.adjust(0, section_slots + 1);
    }

    pub fn emit_leave_or_fire_barrier(&mut self, argc: usize) {
        self.emit(Opcode::LeaveOrFireBarrier, &[argc as u16]);
    }

    // ── Flow ─────────────────────────────────────────────────────────────────

    /// Emits a goto with a zero delta, returning the pc of the instruction
    /// for later binding.
    pub fn emit_goto_forward(&mut self) -> usize {
        let at = self.pc();
        self.emit(Opcode::Goto, &[0]);
        at
    }

    /// Back-patches a forward goto to jump to the current pc.
    pub fn bind_goto(&mut self, goto_pc: usize) {
        debug_assert_eq!(Opcode::from_raw(self.shorts[goto_pc]), Some(Opcode::Goto));
        self.shorts[goto_pc + 1] = (self.pc() - goto_pc) as u16;
    }

    pub fn emit_return(&mut self) {
        self.emit(Opcode::Return, &[]);
    }

    pub fn emit_stack_bottom(&mut self) {
        self.emit(Opcode::StackBottom, &[]);
    }

    pub fn emit_stack_piece_bottom(&mut self) {
        self.emit(Opcode::StackPieceBottom, &[]);
    }

    // ── Flush ────────────────────────────────────────────────────────────────

    /// Builds the code block. The high-water mark gets one extra slot of
    /// headroom for the result values synthetic frames push.
    pub fn flush(&self, heap: &mut Heap, roots: &Roots) -> Result<Value, Condition> {
        let mut bytes = Vec::with_capacity(self.shorts.len() * 2);
        for short in &self.shorts {
            bytes.extend_from_slice(&short.to_le_bytes());
        }
        let bytecode = crate::alloc::new_heap_blob_with_data(heap, roots, &bytes)?;
        let pool = crate::alloc::new_heap_array(heap, roots, self.pool.len())?;
        for (i, &value) in self.pool.iter().enumerate() {
            crate::objects::set_array_at(pool, i, value);
        }
        crate::alloc::new_heap_code_block(heap, roots, bytecode, pool, self.high_water_mark + 1)
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Assembler::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_raw_roundtrip() {
        for raw in 0..OPCODE_COUNT as u16 {
            let opcode = Opcode::from_raw(raw).unwrap();
            assert_eq!(opcode as u16, raw);
        }
        assert_eq!(Opcode::from_raw(OPCODE_COUNT as u16), None);
    }

    #[test]
    fn test_widths_cover_operands() {
        for raw in 0..OPCODE_COUNT as u16 {
            let opcode = Opcode::from_raw(raw).unwrap();
            assert!(opcode.width() >= 1 && opcode.width() <= 4, "{}", opcode.name());
        }
    }

    #[test]
    fn test_assembler_tracks_high_water_mark() {
        let mut assm = Assembler::new();
        assm.emit_push(Value::new_integer(1));
        assm.emit_push(Value::new_integer(2));
        assm.emit_pop(1);
        assm.emit_push(Value::new_integer(3));
        assert_eq!(assm.stack_height(), 2);
        assert_eq!(assm.high_water_mark, 2);
    }

    #[test]
    fn test_assembler_interns_by_identity() {
        let mut assm = Assembler::new();
        let v = Value::new_integer(7);
        assm.emit_push(v);
        assm.emit_push(v);
        assert_eq!(assm.pool.len(), 1);
        assm.emit_push(Value::new_integer(8));
        assert_eq!(assm.pool.len(), 2);
    }

    #[test]
    fn test_goto_binding() {
        let mut assm = Assembler::new();
        assm.emit_push(Value::new_integer(0));
        let goto_pc = assm.emit_goto_forward();
        assm.emit_pop(1);
        assm.bind_goto(goto_pc);
        assert_eq!(assm.shorts[goto_pc + 1], (assm.pc() - goto_pc) as u16);
    }
}
