/// Closure Values — Lambdas, Blocks and Escapes
///
/// A lambda owns its captured values outright. A block does not: it is a
/// tiny heap handle pointing at a BlockSection derived object on the stack,
/// through which outer state is _refracted_ rather than captured; when the
/// creating scope exits the section dies and the block with it. An escape is
/// the same shape of handle around an EscapeSection holding a full frame
/// snapshot.

use crate::core::tagged::is_nothing;
use crate::core::value::{Condition, Value};
use crate::heap::{get_heap_object_field, heap_object_field_offset, set_heap_object_field};
use crate::objects::get_array_at;
use crate::runtime::Runtime;
use crate::species::{self, Family, PrintContext};

// ---------------------------------------------------------------------------
// Lambda
// ---------------------------------------------------------------------------

pub const LAMBDA_METHODS_OFFSET: usize = heap_object_field_offset(0);
pub const LAMBDA_CAPTURES_OFFSET: usize = heap_object_field_offset(1);
pub const LAMBDA_FIELD_COUNT: usize = 2;

/// The methodspace consulted when the lambda is called through the
/// `lambda()` delegate.
pub fn get_lambda_methods(lambda: Value) -> Value {
    get_heap_object_field(lambda, LAMBDA_METHODS_OFFSET)
}

pub fn set_lambda_methods(lambda: Value, methods: Value) {
    set_heap_object_field(lambda, LAMBDA_METHODS_OFFSET, methods);
}

pub fn get_lambda_captures(lambda: Value) -> Value {
    get_heap_object_field(lambda, LAMBDA_CAPTURES_OFFSET)
}

pub fn set_lambda_captures(lambda: Value, captures: Value) {
    set_heap_object_field(lambda, LAMBDA_CAPTURES_OFFSET, captures);
}

pub fn get_lambda_capture(lambda: Value, index: usize) -> Value {
    debug_assert!(species::in_family(Family::Lambda, lambda));
    get_array_at(get_lambda_captures(lambda), index)
}

pub fn lambda_print_on(lambda: Value, context: &mut PrintContext) {
    use std::fmt::Write;
    let _ = write!(context.buf, "lambda~{:x}", lambda.raw());
}

pub fn ensure_lambda_owned_values_frozen(
    runtime: &mut Runtime,
    lambda: Value,
) -> Result<(), Condition> {
    species::ensure_frozen(runtime, get_lambda_captures(lambda))
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

pub const BLOCK_SECTION_OFFSET: usize = heap_object_field_offset(0);
pub const BLOCK_FIELD_COUNT: usize = 1;

/// The BlockSection this block refracts through; nothing once the block's
/// scope has exited, at which point the block is dead.
pub fn get_block_section(block: Value) -> Value {
    get_heap_object_field(block, BLOCK_SECTION_OFFSET)
}

pub fn set_block_section(block: Value, section: Value) {
    set_heap_object_field(block, BLOCK_SECTION_OFFSET, section);
}

pub fn is_block_live(block: Value) -> bool {
    !is_nothing(get_block_section(block))
}

pub fn block_validate(block: Value) -> Result<(), Condition> {
    let section = get_block_section(block);
    if !is_nothing(section)
        && !crate::derived::in_genus(crate::derived::Genus::BlockSection, section)
    {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

pub fn block_print_on(block: Value, context: &mut PrintContext) {
    use std::fmt::Write;
    let _ = write!(context.buf, "block~{:x}", block.raw());
}

// ---------------------------------------------------------------------------
// Escape
// ---------------------------------------------------------------------------

pub const ESCAPE_SECTION_OFFSET: usize = heap_object_field_offset(0);
pub const ESCAPE_FIELD_COUNT: usize = 1;

/// The EscapeSection holding the captured frame state; nothing once the
/// escape's scope has exited, making the escape dead.
pub fn get_escape_section(escape: Value) -> Value {
    get_heap_object_field(escape, ESCAPE_SECTION_OFFSET)
}

pub fn set_escape_section(escape: Value, section: Value) {
    set_heap_object_field(escape, ESCAPE_SECTION_OFFSET, section);
}

pub fn is_escape_live(escape: Value) -> bool {
    !is_nothing(get_escape_section(escape))
}

pub fn escape_validate(escape: Value) -> Result<(), Condition> {
    let section = get_escape_section(escape);
    if !is_nothing(section)
        && !crate::derived::in_genus(crate::derived::Genus::EscapeSection, section)
    {
        return Err(Condition::validation_failed());
    }
    Ok(())
}
