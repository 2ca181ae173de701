/// Stacks, Stack Pieces and Frames
///
/// A stack is a chain of fixed-capacity pieces, newest first. All bookkeeping
/// about the piece currently executing lives in a transient `Frame` struct;
/// opening a stack piece reads its lid frame into a `Frame`, closing writes
/// the state back as a synthetic lid frame. A piece is closed exactly when
/// its lid frame pointer field holds an integer.
///
/// Frame layout within a piece's storage (addresses grow upwards):
///
///   ...                     <- limit_pointer
///   locals / operands
///   ...                     <- stack_pointer
///   [argument map   ]  -+
///   [code block     ]   |
///   [previous pc    ]   |  frame header, below frame_pointer
///   [previous flags ]   |
///   [previous limit ]   |
///   [previous fp    ]  -+
///   arguments (in the caller's frame)
///
/// Pushing a frame that doesn't fit allocates a new piece, seeds it with a
/// synthetic stack-piece-bottom frame whose code returns control to the old
/// piece, transfers the pending arguments across and retries.

use std::fmt::Write;

use crate::core::tagged::{
    self, get_flag_set_at, is_nothing, new_flag_set, nothing,
};
use crate::core::value::{Condition, Value, VALUE_SIZE};
use crate::heap::{
    get_heap_object_field, heap_object_field_offset, read_word, set_heap_object_field,
    write_word, Heap, HeapObjectLayout, HEAP_OBJECT_HEADER_SIZE,
};
use crate::objects::get_array_length;
use crate::runtime::Roots;
use crate::species::{self, Family, PrintContext};

// ---------------------------------------------------------------------------
// Stack piece
// ---------------------------------------------------------------------------

pub const STACK_PIECE_CAPACITY_OFFSET: usize = heap_object_field_offset(0);
pub const STACK_PIECE_PREVIOUS_OFFSET: usize = heap_object_field_offset(1);
pub const STACK_PIECE_STACK_OFFSET: usize = heap_object_field_offset(2);
pub const STACK_PIECE_LID_FRAME_POINTER_OFFSET: usize = heap_object_field_offset(3);
pub const STACK_PIECE_STORAGE_OFFSET: usize = heap_object_field_offset(4);
pub const STACK_PIECE_HEADER_FIELD_COUNT: usize = 4;

/// Size in bytes of a stack piece with the given capacity in value slots.
pub const fn calc_stack_piece_size(capacity: usize) -> usize {
    STACK_PIECE_STORAGE_OFFSET + capacity * VALUE_SIZE
}

pub fn get_stack_piece_capacity(piece: Value) -> usize {
    get_heap_object_field(piece, STACK_PIECE_CAPACITY_OFFSET).as_integer() as usize
}

pub fn get_stack_piece_previous(piece: Value) -> Value {
    get_heap_object_field(piece, STACK_PIECE_PREVIOUS_OFFSET)
}

pub fn set_stack_piece_previous(piece: Value, previous: Value) {
    set_heap_object_field(piece, STACK_PIECE_PREVIOUS_OFFSET, previous);
}

pub fn get_stack_piece_stack(piece: Value) -> Value {
    get_heap_object_field(piece, STACK_PIECE_STACK_OFFSET)
}

pub fn set_stack_piece_stack(piece: Value, stack: Value) {
    set_heap_object_field(piece, STACK_PIECE_STACK_OFFSET, stack);
}

pub fn get_stack_piece_lid_frame_pointer(piece: Value) -> Value {
    get_heap_object_field(piece, STACK_PIECE_LID_FRAME_POINTER_OFFSET)
}

pub fn set_stack_piece_lid_frame_pointer(piece: Value, value: Value) {
    set_heap_object_field(piece, STACK_PIECE_LID_FRAME_POINTER_OFFSET, value);
}

/// Byte address of the first storage slot.
pub fn get_stack_piece_storage_start(piece: Value) -> usize {
    piece.heap_object_address() + STACK_PIECE_STORAGE_OFFSET
}

pub fn is_stack_piece_closed(piece: Value) -> bool {
    get_stack_piece_lid_frame_pointer(piece).is_integer()
}

pub fn stack_piece_layout(piece: Value) -> HeapObjectLayout {
    let capacity = get_heap_object_field(piece, STACK_PIECE_CAPACITY_OFFSET).as_integer() as usize;
    HeapObjectLayout::new(calc_stack_piece_size(capacity), HEAP_OBJECT_HEADER_SIZE)
}

pub fn stack_piece_validate(piece: Value) -> Result<(), Condition> {
    if !get_heap_object_field(piece, STACK_PIECE_CAPACITY_OFFSET).is_integer() {
        return Err(Condition::validation_failed());
    }
    if !species::in_family_opt(Family::StackPiece, get_stack_piece_previous(piece)) {
        return Err(Condition::validation_failed());
    }
    if !species::in_family_opt(Family::Stack, get_stack_piece_stack(piece)) {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

pub fn stack_piece_print_on(piece: Value, context: &mut PrintContext) {
    let _ = write!(
        context.buf,
        "#<stack piece ~{:x}: st@{}>",
        piece.raw(),
        get_stack_piece_capacity(piece)
    );
}

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

pub const STACK_TOP_PIECE_OFFSET: usize = heap_object_field_offset(0);
pub const STACK_DEFAULT_PIECE_CAPACITY_OFFSET: usize = heap_object_field_offset(1);
pub const STACK_TOP_BARRIER_OFFSET: usize = heap_object_field_offset(2);
pub const STACK_FIELD_COUNT: usize = 3;

pub fn get_stack_top_piece(stack: Value) -> Value {
    get_heap_object_field(stack, STACK_TOP_PIECE_OFFSET)
}

pub fn set_stack_top_piece(stack: Value, piece: Value) {
    set_heap_object_field(stack, STACK_TOP_PIECE_OFFSET, piece);
}

pub fn get_stack_default_piece_capacity(stack: Value) -> usize {
    get_heap_object_field(stack, STACK_DEFAULT_PIECE_CAPACITY_OFFSET).as_integer() as usize
}

/// The innermost scoped derived object on this stack, or nothing.
pub fn get_stack_top_barrier(stack: Value) -> Value {
    get_heap_object_field(stack, STACK_TOP_BARRIER_OFFSET)
}

pub fn set_stack_top_barrier(stack: Value, barrier: Value) {
    set_heap_object_field(stack, STACK_TOP_BARRIER_OFFSET, barrier);
}

pub fn stack_validate(stack: Value) -> Result<(), Condition> {
    if !species::in_family(Family::StackPiece, get_stack_top_piece(stack)) {
        return Err(Condition::validation_failed());
    }
    let mut current = get_stack_top_piece(stack);
    while !is_nothing(current) {
        if get_stack_piece_stack(current) != stack {
            return Err(Condition::validation_failed());
        }
        current = get_stack_piece_previous(current);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Frame flags
// ---------------------------------------------------------------------------

pub mod frame_flags {
    /// Not pushed by the program being executed.
    pub const SYNTHETIC: u64 = 0x01;
    /// The bottom frame of a stack piece; returning through it crosses to
    /// the previous piece.
    pub const STACK_PIECE_BOTTOM: u64 = 0x02;
    /// The piece below this frame is empty.
    pub const STACK_PIECE_EMPTY: u64 = 0x04;
    /// The bottom frame of the whole stack.
    pub const STACK_BOTTOM: u64 = 0x08;
    /// A frame the interpreter actually executes.
    pub const ORGANIC: u64 = 0x10;
    /// The lid of a closed stack piece.
    pub const LID: u64 = 0x20;
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// Number of header fields below a frame pointer.
pub const FRAME_HEADER_FIELD_COUNT: usize = 6;
pub const FRAME_HEADER_SIZE: usize = FRAME_HEADER_FIELD_COUNT * VALUE_SIZE;

const HEADER_PREVIOUS_FRAME_POINTER: usize = 0;
const HEADER_PREVIOUS_LIMIT_POINTER: usize = 1;
const HEADER_PREVIOUS_FLAGS: usize = 2;
const HEADER_PREVIOUS_PC: usize = 3;
const HEADER_CODE_BLOCK: usize = 4;
const HEADER_ARGUMENT_MAP: usize = 5;

/// A transient view of the top frame of an open stack piece. Never lives in
/// the heap; all pointers are byte addresses into the piece's storage and
/// are invalidated by a collection, which is why frames are closed before
/// any condition crosses the interpreter boundary.
#[derive(Clone, Copy)]
pub struct Frame {
    pub stack_pointer: usize,
    pub frame_pointer: usize,
    pub limit_pointer: usize,
    pub flags: Value,
    pub stack_piece: Value,
    pub pc: usize,
}

impl Frame {
    pub fn empty() -> Frame {
        Frame {
            stack_pointer: 0,
            frame_pointer: 0,
            limit_pointer: 0,
            flags: new_flag_set(tagged::FLAG_SET_ALL_OFF),
            stack_piece: nothing(),
            pc: 0,
        }
    }

    pub fn has_flag(&self, flag: u64) -> bool {
        get_flag_set_at(self.flags, flag)
    }

    /// Byte address of the bottom of this frame's piece storage.
    pub fn stack_piece_bottom(&self) -> usize {
        get_stack_piece_storage_start(self.stack_piece)
    }

    pub fn stack_piece_top(&self) -> usize {
        self.stack_piece_bottom() + get_stack_piece_capacity(self.stack_piece) * VALUE_SIZE
    }

    // ── Header access ────────────────────────────────────────────────────────

    fn header_field_addr(&self, index: usize) -> usize {
        debug_assert!(index < FRAME_HEADER_FIELD_COUNT);
        let addr = self.frame_pointer - (index + 1) * VALUE_SIZE;
        debug_assert!(addr >= self.stack_piece_bottom());
        addr
    }

    pub fn get_previous_frame_pointer(&self) -> usize {
        Value::from_raw(read_word(self.header_field_addr(HEADER_PREVIOUS_FRAME_POINTER)))
            .as_integer() as usize
    }

    pub fn set_previous_frame_pointer(&self, slots: usize) {
        write_word(
            self.header_field_addr(HEADER_PREVIOUS_FRAME_POINTER),
            Value::new_integer(slots as i64).raw(),
        );
    }

    pub fn get_previous_limit_pointer(&self) -> usize {
        Value::from_raw(read_word(self.header_field_addr(HEADER_PREVIOUS_LIMIT_POINTER)))
            .as_integer() as usize
    }

    pub fn set_previous_limit_pointer(&self, slots: usize) {
        write_word(
            self.header_field_addr(HEADER_PREVIOUS_LIMIT_POINTER),
            Value::new_integer(slots as i64).raw(),
        );
    }

    pub fn get_previous_flags(&self) -> Value {
        Value::from_raw(read_word(self.header_field_addr(HEADER_PREVIOUS_FLAGS)))
    }

    pub fn set_previous_flags(&self, flags: Value) {
        write_word(self.header_field_addr(HEADER_PREVIOUS_FLAGS), flags.raw());
    }

    pub fn get_previous_pc(&self) -> usize {
        Value::from_raw(read_word(self.header_field_addr(HEADER_PREVIOUS_PC))).as_integer() as usize
    }

    pub fn set_previous_pc(&self, pc: usize) {
        write_word(self.header_field_addr(HEADER_PREVIOUS_PC), Value::new_integer(pc as i64).raw());
    }

    pub fn get_code_block(&self) -> Value {
        Value::from_raw(read_word(self.header_field_addr(HEADER_CODE_BLOCK)))
    }

    pub fn set_code_block(&self, code_block: Value) {
        write_word(self.header_field_addr(HEADER_CODE_BLOCK), code_block.raw());
    }

    pub fn get_argument_map(&self) -> Value {
        Value::from_raw(read_word(self.header_field_addr(HEADER_ARGUMENT_MAP)))
    }

    pub fn set_argument_map(&self, map: Value) {
        write_word(self.header_field_addr(HEADER_ARGUMENT_MAP), map.raw());
    }

    // ── Value stack ──────────────────────────────────────────────────────────

    fn is_within_frame(&self, addr: usize) -> bool {
        self.frame_pointer <= addr && addr < self.limit_pointer
    }

    pub fn push_value(&mut self, value: Value) -> Result<(), Condition> {
        if !self.is_within_frame(self.stack_pointer) {
            return Err(Condition::out_of_bounds(
                (self.stack_pointer - self.stack_piece_bottom()) / VALUE_SIZE,
            ));
        }
        write_word(self.stack_pointer, value.raw());
        self.stack_pointer += VALUE_SIZE;
        Ok(())
    }

    pub fn pop_value(&mut self) -> Value {
        debug_assert!(self.stack_pointer > self.frame_pointer, "pop out of frame bounds");
        self.stack_pointer -= VALUE_SIZE;
        Value::from_raw(read_word(self.stack_pointer))
    }

    pub fn peek_value(&self, index: usize) -> Value {
        Value::from_raw(read_word(self.stack_pointer - (index + 1) * VALUE_SIZE))
    }

    /// Height of the operand stack above the frame pointer, in slots.
    pub fn stack_height(&self) -> usize {
        (self.stack_pointer - self.frame_pointer) / VALUE_SIZE
    }

    /// Carves a region of `size` slots off the top of the frame, returning
    /// its start address. Used for derived object allocation.
    pub fn alloc_slots(&mut self, size: usize) -> usize {
        debug_assert!(self.is_within_frame(self.stack_pointer + (size - 1) * VALUE_SIZE));
        let start = self.stack_pointer;
        self.stack_pointer += size * VALUE_SIZE;
        start
    }

    // ── Arguments and locals ─────────────────────────────────────────────────

    /// The arguments sit in the caller's frame, just below this frame's
    /// header; the argument map translates parameter index to offset from
    /// that boundary.
    pub fn get_argument(&self, param_index: usize) -> Value {
        let below_header = self.frame_pointer - FRAME_HEADER_SIZE;
        let arg_map = self.get_argument_map();
        let offset = crate::objects::get_array_at(arg_map, param_index).as_integer() as usize;
        Value::from_raw(read_word(below_header - (offset + 1) * VALUE_SIZE))
    }

    pub fn set_argument(&self, param_index: usize, value: Value) {
        let below_header = self.frame_pointer - FRAME_HEADER_SIZE;
        let arg_map = self.get_argument_map();
        let offset = crate::objects::get_array_at(arg_map, param_index).as_integer() as usize;
        write_word(below_header - (offset + 1) * VALUE_SIZE, value.raw());
    }

    /// Argument by evaluation order, bypassing the argument map.
    pub fn get_raw_argument(&self, eval_index: usize) -> Value {
        let below_header = self.frame_pointer - FRAME_HEADER_SIZE;
        Value::from_raw(read_word(below_header - (eval_index + 1) * VALUE_SIZE))
    }

    /// The index'th pending argument of a call about to be dispatched, where
    /// the offsets come from the call tags.
    pub fn get_pending_argument_at(&self, tags: Value, index: usize) -> Value {
        let offset = crate::method::get_call_tags_offset_at(tags, index);
        self.peek_value(offset)
    }

    pub fn get_local(&self, index: usize) -> Result<Value, Condition> {
        let addr = self.frame_pointer + index * VALUE_SIZE;
        if addr >= self.stack_pointer {
            return Err(Condition::out_of_bounds(index));
        }
        Ok(Value::from_raw(read_word(addr)))
    }

    // ── Walking ──────────────────────────────────────────────────────────────

    /// Pops this frame, restoring the one below from the header fields. Only
    /// valid within a piece.
    pub fn walk_down_stack(&mut self) {
        let snapshot = *self;
        let bottom = self.stack_piece_bottom();
        self.frame_pointer = bottom + snapshot.get_previous_frame_pointer() * VALUE_SIZE;
        self.limit_pointer = bottom + snapshot.get_previous_limit_pointer() * VALUE_SIZE;
        self.flags = snapshot.get_previous_flags();
        self.pc = snapshot.get_previous_pc();
        self.stack_pointer = snapshot.frame_pointer - FRAME_HEADER_SIZE;
    }

    pub fn pop_within_stack_piece(&mut self) {
        debug_assert!(!is_stack_piece_closed(self.stack_piece));
        debug_assert!(!self.has_flag(frame_flags::STACK_PIECE_EMPTY));
        self.walk_down_stack();
    }
}

/// Pushes a new frame above the current one if the piece has room. On
/// success the frame struct describes the new frame; on failure it is
/// untouched. A header's worth of slots is held back for the lid except when
/// pushing the lid itself.
pub fn try_push_new_frame(frame: &mut Frame, capacity: usize, flags: u64, is_lid: bool) -> bool {
    let piece = frame.stack_piece;
    debug_assert!(!is_stack_piece_closed(piece));
    let old_frame = *frame;
    let mut piece_limit = frame.stack_piece_top();
    if !is_lid {
        piece_limit -= FRAME_HEADER_SIZE;
    }
    let new_frame_pointer = old_frame.stack_pointer + FRAME_HEADER_SIZE;
    let new_frame_limit = new_frame_pointer + capacity * VALUE_SIZE;
    if new_frame_limit > piece_limit {
        return false;
    }
    frame.stack_pointer = new_frame_pointer;
    frame.frame_pointer = new_frame_pointer;
    frame.limit_pointer = new_frame_limit;
    frame.flags = new_flag_set(flags);
    frame.pc = 0;
    let bottom = frame.stack_piece_bottom();
    frame.set_previous_frame_pointer((old_frame.frame_pointer - bottom) / VALUE_SIZE);
    frame.set_previous_limit_pointer((old_frame.limit_pointer - bottom) / VALUE_SIZE);
    frame.set_previous_flags(old_frame.flags);
    frame.set_previous_pc(old_frame.pc);
    frame.set_code_block(nothing());
    frame.set_argument_map(nothing());
    true
}

/// Reads the lid of a closed piece into a frame without mutating the piece.
fn read_stack_piece_lid(piece: Value, frame: &mut Frame) {
    debug_assert!(is_stack_piece_closed(piece));
    frame.stack_piece = piece;
    let bottom = get_stack_piece_storage_start(piece);
    frame.frame_pointer =
        bottom + get_stack_piece_lid_frame_pointer(piece).as_integer() as usize * VALUE_SIZE;
    // The lid has no capacity of its own, so walking down from it restores
    // the frame that was on top when the piece was closed.
    frame.stack_pointer = frame.frame_pointer;
    frame.limit_pointer = frame.frame_pointer;
    frame.flags = new_flag_set(frame_flags::LID | frame_flags::SYNTHETIC);
    frame.walk_down_stack();
}

/// Opens a closed piece: reads the lid into the frame and clears the lid
/// marker.
pub fn open_stack_piece(piece: Value, frame: &mut Frame) {
    debug_assert!(species::in_family(Family::StackPiece, piece));
    read_stack_piece_lid(piece, frame);
    set_stack_piece_lid_frame_pointer(piece, nothing());
}

/// Closes the piece the frame is executing on, recording the frame state in
/// a synthetic lid frame.
pub fn close_frame(frame: &mut Frame) {
    let piece = frame.stack_piece;
    debug_assert!(!is_stack_piece_closed(piece));
    let pushed = try_push_new_frame(
        frame,
        0,
        frame_flags::LID | frame_flags::SYNTHETIC,
        true,
    );
    debug_assert!(pushed, "failed to close frame");
    let bottom = frame.stack_piece_bottom();
    set_stack_piece_lid_frame_pointer(
        piece,
        Value::new_integer(((frame.frame_pointer - bottom) / VALUE_SIZE) as i64),
    );
    frame.stack_piece = nothing();
    frame.frame_pointer = 0;
    frame.limit_pointer = 0;
    frame.stack_pointer = 0;
    frame.pc = 0;
}

/// Opens the top piece of a stack.
pub fn open_stack(stack: Value) -> Frame {
    debug_assert!(species::in_family(Family::Stack, stack));
    let mut frame = Frame::empty();
    open_stack_piece(get_stack_top_piece(stack), &mut frame);
    frame
}

// ── Cross-piece push ─────────────────────────────────────────────────────────

/// Transfers the `arg_count` values on top of the old frame to the bottom of
/// the new piece, where they become the arguments of the method about to run.
fn transfer_top_arguments(new_piece: Value, frame: &Frame, arg_count: usize) {
    let mut new_frame = Frame::empty();
    open_stack_piece(new_piece, &mut new_frame);
    for i in 0..arg_count {
        let value = frame.peek_value(arg_count - i - 1);
        new_frame.push_value(value).expect("transfer into fresh piece");
    }
    close_frame(&mut new_frame);
}

fn push_stack_piece_bottom_frame(roots: &Roots, stack_piece: Value, arg_map: Value) {
    let mut bottom = Frame::empty();
    let code_block = roots.stack_piece_bottom_code_block();
    open_stack_piece(stack_piece, &mut bottom);
    // The transferred arguments will appear as if they were pushed by this
    // frame so it needs room for them.
    let arg_count = get_array_length(arg_map);
    let pushed = try_push_new_frame(
        &mut bottom,
        crate::bytecode::get_code_block_high_water_mark(code_block) + arg_count,
        frame_flags::SYNTHETIC | frame_flags::STACK_PIECE_BOTTOM,
        false,
    );
    debug_assert!(pushed, "pushing bottom frame");
    bottom.set_code_block(code_block);
    bottom.set_argument_map(arg_map);
    close_frame(&mut bottom);
}

/// Pushes a new organic frame with room for `frame_capacity` slots, growing
/// the stack with a fresh piece when the top piece is out of room. The
/// argument map's length gives how many pending arguments transfer to the
/// new piece.
pub fn push_stack_frame(
    heap: &mut Heap,
    roots: &Roots,
    stack: Value,
    frame: &mut Frame,
    frame_capacity: usize,
    arg_map: Value,
) -> Result<(), Condition> {
    debug_assert!(species::in_family(Family::Stack, stack));
    let top_piece = get_stack_top_piece(stack);
    debug_assert!(!is_stack_piece_closed(top_piece));
    if !try_push_new_frame(frame, frame_capacity, frame_flags::ORGANIC, false) {
        let default_capacity = get_stack_default_piece_capacity(stack);
        let transfer_arg_count = if is_nothing(arg_map) { 0 } else { get_array_length(arg_map) };
        let required_capacity = frame_capacity // the new frame's locals
            + FRAME_HEADER_FIELD_COUNT         // the new frame's header
            + 1                                // the bottom frame's one local
            + FRAME_HEADER_FIELD_COUNT         // the bottom frame's header
            + FRAME_HEADER_FIELD_COUNT         // room to close the piece
            + transfer_arg_count;
        let new_capacity = default_capacity.max(required_capacity);

        // Create and initialize the new piece; the frame struct still points
        // at the old piece.
        let new_piece =
            crate::alloc::new_heap_stack_piece(heap, roots, new_capacity, top_piece, stack)?;
        let transfer_map = if is_nothing(arg_map) { roots.empty_array() } else { arg_map };
        push_stack_piece_bottom_frame(roots, new_piece, transfer_map);
        transfer_top_arguments(new_piece, frame, transfer_arg_count);
        set_stack_top_piece(stack, new_piece);

        // Close the previous piece, recording the frame state.
        close_frame(frame);

        // The capacity calculation guarantees this push succeeds.
        open_stack_piece(new_piece, frame);
        let pushed = try_push_new_frame(frame, frame_capacity, frame_flags::ORGANIC, false);
        debug_assert!(pushed, "pushing on new piece failed");
    }
    frame.set_argument_map(arg_map);
    Ok(())
}

// ---------------------------------------------------------------------------
// Frame iterator
// ---------------------------------------------------------------------------

/// Walks frames downwards and across piece boundaries, yielding only organic
/// frames. Used for backtraces and signal-handler lookup.
pub struct FrameIter {
    current: Frame,
}

impl FrameIter {
    pub fn from_frame(frame: &Frame) -> FrameIter {
        FrameIter { current: *frame }
    }

    pub fn current(&self) -> &Frame {
        &self.current
    }

    /// Advances to the next organic frame below; false when the bottom of
    /// the stack is reached.
    pub fn advance(&mut self) -> bool {
        loop {
            self.current.walk_down_stack();
            if self.current.has_flag(frame_flags::STACK_PIECE_BOTTOM) {
                // Jump to the previous piece.
                let previous = get_stack_piece_previous(self.current.stack_piece);
                self.current.stack_piece = previous;
                read_stack_piece_lid(previous, &mut self.current);
            } else if self.current.has_flag(frame_flags::STACK_BOTTOM) {
                return false;
            }
            if self.current.has_flag(frame_flags::ORGANIC) {
                return true;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_flags_disjoint() {
        let all = [
            frame_flags::SYNTHETIC,
            frame_flags::STACK_PIECE_BOTTOM,
            frame_flags::STACK_PIECE_EMPTY,
            frame_flags::STACK_BOTTOM,
            frame_flags::ORGANIC,
            frame_flags::LID,
        ];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                if i != j {
                    assert_eq!(a & b, 0);
                }
            }
        }
    }

    #[test]
    fn test_empty_frame_has_no_flags() {
        let frame = Frame::empty();
        assert!(!frame.has_flag(frame_flags::ORGANIC));
        assert!(!frame.has_flag(frame_flags::LID));
    }
}
