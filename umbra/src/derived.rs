/// Derived Objects — Objects Embedded In Other Objects' Storage
///
/// A derived object is a tagged interior pointer into a host object, aimed
/// at the _anchor_ slot: a custom tagged word packing the object's genus and
/// its byte offset within the host. Fields sit on both sides of the anchor:
///
///   ... host ... [before fields] [anchor] [after fields] ... host ...
///
/// The offset in the anchor keeps derived pointers and their hosts in sync
/// when the collector moves the host. Derived objects make stack slots look
/// like proper objects, which is how escape/ensure/block/signal-handler
/// state lives on the stack with no heap allocation.
///
/// Scoped genera participate in the stack's barrier chain. Field layout
/// relative to the anchor, in slots:
///
///   escape state (escape/signal-handler only):  sp −7, fp −6, lp −5,
///                                               flags −4, pc −3
///   barrier state (all scoped):                 payload −2, previous −1
///   refraction point (all scoped):              frame pointer +1
///   block section methodspace:                  +2

use crate::core::tagged::{
    get_anchor_genus_raw, get_anchor_host_offset, new_derived_object_anchor, nothing,
};
use crate::core::value::{Condition, Value, VALUE_SIZE};
use crate::heap::{read_word, write_word};
use crate::stack::{
    get_stack_piece_stack, get_stack_piece_storage_start, get_stack_top_barrier,
    set_stack_top_barrier, Frame,
};

// ---------------------------------------------------------------------------
// Genera
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Genus {
    StackPointer = 0,
    EscapeSection = 1,
    EnsureSection = 2,
    BlockSection = 3,
    SignalHandlerSection = 4,
}

pub const GENUS_COUNT: usize = 5;

impl Genus {
    pub fn from_raw(raw: u8) -> Genus {
        match raw {
            0 => Genus::StackPointer,
            1 => Genus::EscapeSection,
            2 => Genus::EnsureSection,
            3 => Genus::BlockSection,
            _ => Genus::SignalHandlerSection,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Genus::StackPointer         => "StackPointer",
            Genus::EscapeSection        => "EscapeSection",
            Genus::EnsureSection        => "EnsureSection",
            Genus::BlockSection         => "BlockSection",
            Genus::SignalHandlerSection => "SignalHandlerSection",
        }
    }
}

/// Static description of a genus: how many fields flank the anchor and
/// whether leaving the scope has an exit action.
pub struct GenusDescriptor {
    pub genus: Genus,
    pub before_field_count: usize,
    pub after_field_count: usize,
    pub scoped: bool,
}

impl GenusDescriptor {
    pub const fn field_count(&self) -> usize {
        self.before_field_count + 1 + self.after_field_count
    }
}

pub static GENUS_DESCRIPTORS: [GenusDescriptor; GENUS_COUNT] = [
    GenusDescriptor {
        genus: Genus::StackPointer,
        before_field_count: 0,
        after_field_count: 0,
        scoped: false,
    },
    GenusDescriptor {
        genus: Genus::EscapeSection,
        before_field_count: 7,
        after_field_count: 1,
        scoped: true,
    },
    GenusDescriptor {
        genus: Genus::EnsureSection,
        before_field_count: 2,
        after_field_count: 1,
        scoped: true,
    },
    GenusDescriptor {
        genus: Genus::BlockSection,
        before_field_count: 2,
        after_field_count: 2,
        scoped: true,
    },
    GenusDescriptor {
        genus: Genus::SignalHandlerSection,
        before_field_count: 7,
        after_field_count: 1,
        scoped: true,
    },
];

pub fn get_genus_descriptor(genus: Genus) -> &'static GenusDescriptor {
    &GENUS_DESCRIPTORS[genus as usize]
}

// ---------------------------------------------------------------------------
// Core access
// ---------------------------------------------------------------------------

#[inline]
pub fn get_derived_object_anchor(derived: Value) -> Value {
    Value::from_raw(read_word(derived.derived_object_anchor_address()))
}

#[inline]
pub fn set_derived_object_anchor(derived: Value, anchor: Value) {
    write_word(derived.derived_object_anchor_address(), anchor.raw());
}

#[inline]
pub fn get_derived_object_genus(derived: Value) -> Genus {
    Genus::from_raw(get_anchor_genus_raw(get_derived_object_anchor(derived)))
}

pub fn in_genus(genus: Genus, value: Value) -> bool {
    value.is_derived_object() && get_derived_object_genus(value) == genus
}

/// The host object this derived object is embedded in, recovered from the
/// anchor's offset.
#[inline]
pub fn get_derived_object_host(derived: Value) -> Value {
    let anchor_addr = derived.derived_object_anchor_address();
    let host_offset = get_anchor_host_offset(get_derived_object_anchor(derived));
    Value::new_heap_object(anchor_addr - host_offset)
}

/// Field at a slot offset relative to the anchor (negative for before
/// fields, positive for after fields).
#[inline]
fn derived_field_addr(derived: Value, slot: isize) -> usize {
    (derived.derived_object_anchor_address() as isize + slot * VALUE_SIZE as isize) as usize
}

#[inline]
pub fn get_derived_field(derived: Value, slot: isize) -> Value {
    Value::from_raw(read_word(derived_field_addr(derived, slot)))
}

#[inline]
pub fn set_derived_field(derived: Value, slot: isize, value: Value) {
    write_word(derived_field_addr(derived, slot), value.raw());
}

/// Builds a derived object in the given memory (a region inside the host's
/// storage) and installs the anchor. The memory length must match the genus'
/// field count.
pub fn alloc_derived_object(memory_start: usize, desc: &GenusDescriptor, host: Value) -> Value {
    let anchor_addr = memory_start + desc.before_field_count * VALUE_SIZE;
    let host_offset = anchor_addr - host.heap_object_address();
    let anchor = new_derived_object_anchor(desc.genus as u8, host_offset);
    let result = Value::new_derived_object(anchor_addr);
    set_derived_object_anchor(result, anchor);
    debug_assert_eq!(get_derived_object_host(result), host);
    result
}

// ---------------------------------------------------------------------------
// Barrier state (all scoped genera)
// ---------------------------------------------------------------------------

const BARRIER_PAYLOAD_SLOT: isize = -2;
const BARRIER_PREVIOUS_SLOT: isize = -1;

pub fn get_barrier_state_payload(barrier: Value) -> Value {
    get_derived_field(barrier, BARRIER_PAYLOAD_SLOT)
}

pub fn set_barrier_state_payload(barrier: Value, payload: Value) {
    set_derived_field(barrier, BARRIER_PAYLOAD_SLOT, payload);
}

pub fn get_barrier_state_previous(barrier: Value) -> Value {
    get_derived_field(barrier, BARRIER_PREVIOUS_SLOT)
}

pub fn set_barrier_state_previous(barrier: Value, previous: Value) {
    set_derived_field(barrier, BARRIER_PREVIOUS_SLOT, previous);
}

/// Unhooks the barrier, which must be the innermost one on the stack.
pub fn barrier_state_unregister(barrier: Value, stack: Value) {
    debug_assert!(barrier.is_derived_object());
    debug_assert_eq!(get_stack_top_barrier(stack), barrier);
    set_stack_top_barrier(stack, get_barrier_state_previous(barrier));
}

// ---------------------------------------------------------------------------
// Refraction point (all scoped genera)
// ---------------------------------------------------------------------------

const REFRACTION_FRAME_POINTER_SLOT: isize = 1;

/// The frame pointer, in slots from the piece storage bottom, of the frame
/// that created this section.
pub fn get_refraction_point_frame_pointer(section: Value) -> Value {
    get_derived_field(section, REFRACTION_FRAME_POINTER_SLOT)
}

pub fn refraction_point_init(section: Value, frame: &Frame) {
    let offset = (frame.frame_pointer - frame.stack_piece_bottom()) / VALUE_SIZE;
    set_derived_field(
        section,
        REFRACTION_FRAME_POINTER_SLOT,
        Value::new_integer(offset as i64),
    );
}

// ---------------------------------------------------------------------------
// Block section methodspace
// ---------------------------------------------------------------------------

const BLOCK_SECTION_METHODSPACE_SLOT: isize = 2;

pub fn get_block_section_methodspace(section: Value) -> Value {
    get_derived_field(section, BLOCK_SECTION_METHODSPACE_SLOT)
}

pub fn set_block_section_methodspace(section: Value, methodspace: Value) {
    set_derived_field(section, BLOCK_SECTION_METHODSPACE_SLOT, methodspace);
}

// ---------------------------------------------------------------------------
// Escape state (escape and signal handler sections)
// ---------------------------------------------------------------------------

const ESCAPE_STACK_POINTER_SLOT: isize = -7;
const ESCAPE_FRAME_POINTER_SLOT: isize = -6;
const ESCAPE_LIMIT_POINTER_SLOT: isize = -5;
const ESCAPE_FLAGS_SLOT: isize = -4;
const ESCAPE_PC_SLOT: isize = -3;

pub fn get_escape_state_stack_pointer(section: Value) -> Value {
    get_derived_field(section, ESCAPE_STACK_POINTER_SLOT)
}

pub fn get_escape_state_frame_pointer(section: Value) -> Value {
    get_derived_field(section, ESCAPE_FRAME_POINTER_SLOT)
}

pub fn get_escape_state_limit_pointer(section: Value) -> Value {
    get_derived_field(section, ESCAPE_LIMIT_POINTER_SLOT)
}

pub fn get_escape_state_flags(section: Value) -> Value {
    get_derived_field(section, ESCAPE_FLAGS_SLOT)
}

pub fn get_escape_state_pc(section: Value) -> Value {
    get_derived_field(section, ESCAPE_PC_SLOT)
}

/// Records the full frame snapshot needed to restore execution at this
/// section's home. Pointers are stored as slot offsets from the piece
/// storage bottom so they survive collection.
pub fn escape_state_init(
    section: Value,
    stack_pointer: usize,
    frame_pointer: usize,
    limit_pointer: usize,
    flags: Value,
    pc: usize,
) {
    set_derived_field(section, ESCAPE_STACK_POINTER_SLOT, Value::new_integer(stack_pointer as i64));
    set_derived_field(section, ESCAPE_FRAME_POINTER_SLOT, Value::new_integer(frame_pointer as i64));
    set_derived_field(section, ESCAPE_LIMIT_POINTER_SLOT, Value::new_integer(limit_pointer as i64));
    set_derived_field(section, ESCAPE_FLAGS_SLOT, flags);
    set_derived_field(section, ESCAPE_PC_SLOT, Value::new_integer(pc as i64));
}

// ---------------------------------------------------------------------------
// Frame integration
// ---------------------------------------------------------------------------

/// Allocates a derived object on the frame's operand stack. Scoped genera
/// hook into the stack's barrier chain as the new innermost barrier.
pub fn frame_alloc_derived_object(frame: &mut Frame, desc: &GenusDescriptor) -> Value {
    let memory_start = frame.alloc_slots(desc.field_count());
    for i in 0..desc.field_count() {
        write_word(memory_start + i * VALUE_SIZE, nothing().raw());
    }
    let result = alloc_derived_object(memory_start, desc, frame.stack_piece);
    if desc.scoped {
        let stack = get_stack_piece_stack(frame.stack_piece);
        set_barrier_state_previous(result, get_stack_top_barrier(stack));
        set_stack_top_barrier(stack, result);
    }
    result
}

/// Pops a derived object off the frame, zapping its slots.
pub fn frame_destroy_derived_object(frame: &mut Frame, desc: &GenusDescriptor) {
    for _ in 0..desc.field_count() {
        frame.stack_pointer -= VALUE_SIZE;
        write_word(frame.stack_pointer, nothing().raw());
    }
}

/// Exit action fired when a scoped derived object's scope unwinds abnormally.
/// Ensure sections are not handled here; the interpreter runs their shard
/// code instead.
pub fn on_derived_object_exit(barrier: Value) {
    match get_derived_object_genus(barrier) {
        Genus::EscapeSection => {
            // The escape object dies with its section.
            let escape = get_barrier_state_payload(barrier);
            crate::closures::set_escape_section(escape, nothing());
        }
        Genus::BlockSection => {
            let block = get_barrier_state_payload(barrier);
            crate::closures::set_block_section(block, nothing());
        }
        Genus::SignalHandlerSection => {}
        Genus::EnsureSection | Genus::StackPointer => {
            debug_assert!(false, "unexpected barrier genus on exit");
        }
    }
}

/// Validates the section's own invariants.
pub fn derived_object_validate(derived: Value) -> Result<(), Condition> {
    let genus = get_derived_object_genus(derived);
    let desc = get_genus_descriptor(genus);
    if desc.scoped {
        let previous = get_barrier_state_previous(derived);
        if !previous.is_derived_object() && !crate::core::tagged::is_nothing(previous) {
            return Err(Condition::validation_failed());
        }
        if !get_refraction_point_frame_pointer(derived).is_integer() {
            return Err(Condition::validation_failed());
        }
    }
    match genus {
        Genus::EscapeSection | Genus::SignalHandlerSection => {
            if !get_escape_state_stack_pointer(derived).is_integer()
                || !get_escape_state_frame_pointer(derived).is_integer()
                || !get_escape_state_limit_pointer(derived).is_integer()
                || !get_escape_state_pc(derived).is_integer()
            {
                return Err(Condition::validation_failed());
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Barrier iteration
// ---------------------------------------------------------------------------

/// Walks the barrier chain from the innermost barrier outwards.
pub struct BarrierIter {
    current: Value,
}

impl BarrierIter {
    pub fn for_stack(stack: Value) -> BarrierIter {
        BarrierIter { current: get_stack_top_barrier(stack) }
    }

    pub fn current(&self) -> Value {
        self.current
    }

    pub fn advance(&mut self) -> Value {
        self.current = get_barrier_state_previous(self.current);
        self.current
    }
}

// ---------------------------------------------------------------------------
// Refraction
// ---------------------------------------------------------------------------

/// Walks `block_depth` block-subject links back from the refractor to the
/// frame holding the outer scope's state. The resulting frame can read
/// arguments and locals but its stack and limit pointers are only bounded by
/// the piece, and its flags are deliberately not a flag set.
pub fn get_refractor_refracted_frame(refractor: Value, block_depth: usize, frame: &mut Frame) {
    debug_assert!(block_depth > 0, "refractor not nested");
    let mut current = refractor;
    for i in (1..=block_depth).rev() {
        let refraction_point = if current.is_heap_object() {
            crate::closures::get_block_section(current)
        } else {
            debug_assert!(current.is_derived_object());
            current
        };
        let fp_slots =
            get_refraction_point_frame_pointer(refraction_point).as_integer() as usize;
        frame.stack_piece = get_derived_object_host(refraction_point);
        frame.frame_pointer =
            get_stack_piece_storage_start(frame.stack_piece) + fp_slots * VALUE_SIZE;
        if i > 1 {
            current = frame.get_argument(0);
        }
    }
    // The exact extent of the home frame is unknown; the piece bounds are the
    // best safe estimate, and the flags are left unset on purpose.
    frame.limit_pointer = frame.stack_piece_top();
    frame.stack_pointer = frame.stack_piece_top();
    frame.flags = nothing();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_field_counts() {
        assert_eq!(get_genus_descriptor(Genus::StackPointer).field_count(), 1);
        assert_eq!(get_genus_descriptor(Genus::EnsureSection).field_count(), 4);
        assert_eq!(get_genus_descriptor(Genus::BlockSection).field_count(), 5);
        assert_eq!(get_genus_descriptor(Genus::EscapeSection).field_count(), 9);
        assert_eq!(get_genus_descriptor(Genus::SignalHandlerSection).field_count(), 9);
    }

    #[test]
    fn test_descriptor_table_ordered() {
        for (i, desc) in GENUS_DESCRIPTORS.iter().enumerate() {
            assert_eq!(desc.genus as usize, i);
        }
    }
}
