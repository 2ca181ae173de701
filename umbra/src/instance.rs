/// Instances, Types and Identity Hashing
///
/// An instance is a bag of fields (an IdHashMap) whose type, manager and mode
/// live on its species. Changing an instance's mode means switching to a
/// sibling species from the derivatives array, allocating it on first use.
///
/// Hard and soft fields are identity-keyed accessors: a hard field stores on
/// the instance itself, a soft field can additionally attach state to frozen
/// holders through an overlay map.
///
/// The hash source is the per-process generator of identity hash codes; a
/// TinyMT-flavored Mersenne twister plus a serial counter. The hash oracle is
/// the mutable front object that hands out codes and binds them in the
/// source's overlay; freezing the oracle fixes the serial limit so a frozen
/// oracle can only reveal codes that were already bound.

use std::fmt::Write;

use crate::core::tagged::{get_promise_state, new_hash_code, new_promise_state, PromiseState};
use crate::core::value::{Condition, ConditionCause, Value, VALUE_SIZE};
use crate::heap::{
    get_heap_object_field, heap_object_field_offset, read_word, set_heap_object_field,
    write_word, Heap, HeapObjectLayout, HEAP_OBJECT_HEADER_SIZE,
};
use crate::maps;
use crate::runtime::{Roots, Runtime};
use crate::species::{
    self, get_heap_object_species, get_instance_species_derivatives,
    get_instance_species_manager, get_instance_species_primary_type,
    get_instance_species_raw_mode, Family, Mode, PrintContext,
};

// ---------------------------------------------------------------------------
// Type
// ---------------------------------------------------------------------------

pub const TYPE_DISPLAY_NAME_OFFSET: usize = heap_object_field_offset(0);
pub const TYPE_FIELD_COUNT: usize = 1;

pub fn get_type_display_name(value: Value) -> Value {
    get_heap_object_field(value, TYPE_DISPLAY_NAME_OFFSET)
}

pub fn set_type_display_name(value: Value, name: Value) {
    set_heap_object_field(value, TYPE_DISPLAY_NAME_OFFSET, name);
}

pub fn type_print_on(value: Value, context: &mut PrintContext) {
    let name = get_type_display_name(value);
    if species::in_family(Family::Utf8, name) {
        let _ = write!(context.buf, "*{}", crate::objects::get_utf8_contents(name));
    } else {
        let _ = write!(context.buf, "*<type ~{:x}>", value.raw());
    }
}

/// The primary type of any value, used by `is` guards. Instances carry theirs
/// on the species; everything else resolves through the built-in type roots.
pub fn get_primary_type(value: Value, roots: &Roots) -> Value {
    if value.is_heap_object() {
        let species = get_heap_object_species(value);
        if species::get_species_division(species) == species::Division::Instance {
            return get_instance_species_primary_type(species);
        }
        if species::get_species_division(species) == species::Division::CObject {
            return species::get_c_object_species_type(species);
        }
        return roots.builtin_type_for_family(species::get_species_instance_family(species));
    }
    roots.builtin_type_for_immediate(value)
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

pub const INSTANCE_FIELDS_OFFSET: usize = heap_object_field_offset(0);
pub const INSTANCE_FIELD_COUNT: usize = 1;

pub fn get_instance_fields(value: Value) -> Value {
    get_heap_object_field(value, INSTANCE_FIELDS_OFFSET)
}

pub fn set_instance_fields(value: Value, fields: Value) {
    set_heap_object_field(value, INSTANCE_FIELDS_OFFSET, fields);
}

pub fn get_instance_manager(value: Value) -> Value {
    get_instance_species_manager(get_heap_object_species(value))
}

pub fn get_instance_primary_type(value: Value) -> Value {
    get_instance_species_primary_type(get_heap_object_species(value))
}

pub fn get_instance_field(instance: Value, key: Value) -> Result<Value, Condition> {
    maps::get_id_hash_map_at(get_instance_fields(instance), key)
}

/// Sets a field; the instance must be fluid or mutable.
pub fn try_set_instance_field(
    heap: &mut Heap,
    roots: &Roots,
    instance: Value,
    key: Value,
    value: Value,
) -> Result<(), Condition> {
    if species::get_value_mode(instance) > Mode::Mutable {
        return Err(Condition::new(ConditionCause::InvalidModeChange));
    }
    maps::set_id_hash_map_at(heap, roots, get_instance_fields(instance), key, value)
}

pub fn instance_validate(value: Value) -> Result<(), Condition> {
    if !species::in_family(Family::IdHashMap, get_instance_fields(value)) {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

pub fn instance_print_on(value: Value, context: &mut PrintContext) {
    context.buf.push_str("#<instance of ");
    context.depth += 1;
    species::value_print_on(get_instance_primary_type(value), context);
    context.depth -= 1;
    context.buf.push_str(": ");
    context.depth += 1;
    species::value_print_on(get_instance_fields(value), context);
    context.depth -= 1;
    context.buf.push('>');
}

pub fn ensure_instance_owned_values_frozen(
    runtime: &mut Runtime,
    value: Value,
) -> Result<(), Condition> {
    species::ensure_frozen(runtime, get_instance_fields(value))
}

/// Finds the sibling species with the given mode in the derivatives array,
/// allocating and registering it on first use. All siblings share one
/// derivatives buffer so the lookup converges.
pub fn get_or_create_derivative_species(
    runtime: &mut Runtime,
    species_value: Value,
    mode: Mode,
) -> Result<Value, Condition> {
    let derivatives = get_instance_species_derivatives(species_value);
    for i in 0..crate::objects::get_array_buffer_length(derivatives) {
        let candidate = crate::objects::get_array_buffer_at(derivatives, i);
        if get_instance_species_raw_mode(candidate) == mode {
            return Ok(candidate);
        }
    }
    let (heap, roots) = runtime.heap_and_roots();
    let sibling = crate::alloc::new_heap_instance_species(
        heap,
        roots,
        get_instance_species_primary_type(species_value),
        get_instance_species_manager(species_value),
        mode,
        derivatives,
    )?;
    crate::objects::add_to_array_buffer(heap, roots, derivatives, sibling)?;
    Ok(sibling)
}

// ---------------------------------------------------------------------------
// InstanceManager
// ---------------------------------------------------------------------------

pub const INSTANCE_MANAGER_DISPLAY_NAME_OFFSET: usize = heap_object_field_offset(0);
pub const INSTANCE_MANAGER_FIELD_COUNT: usize = 1;

pub fn get_instance_manager_display_name(value: Value) -> Value {
    get_heap_object_field(value, INSTANCE_MANAGER_DISPLAY_NAME_OFFSET)
}

// ---------------------------------------------------------------------------
// Hard and soft fields
// ---------------------------------------------------------------------------

pub const HARD_FIELD_DISPLAY_NAME_OFFSET: usize = heap_object_field_offset(0);
pub const HARD_FIELD_FIELD_COUNT: usize = 1;

pub fn get_hard_field_display_name(value: Value) -> Value {
    get_heap_object_field(value, HARD_FIELD_DISPLAY_NAME_OFFSET)
}

pub fn hard_field_print_on(value: Value, context: &mut PrintContext) {
    context.buf.push('.');
    let name = get_hard_field_display_name(value);
    if species::in_family(Family::Utf8, name) {
        context.buf.push_str(&crate::objects::get_utf8_contents(name));
    } else {
        species::value_print_on(name, context);
    }
}

/// A hard field stores on the instance itself.
pub fn get_hard_field_value(field: Value, holder: Value) -> Result<Value, Condition> {
    get_instance_field(holder, field)
}

pub fn set_hard_field_value(
    heap: &mut Heap,
    roots: &Roots,
    field: Value,
    holder: Value,
    value: Value,
) -> Result<(), Condition> {
    try_set_instance_field(heap, roots, holder, field, value)
}

pub const SOFT_FIELD_DISPLAY_NAME_OFFSET: usize = heap_object_field_offset(0);
pub const SOFT_FIELD_OVERLAY_OFFSET: usize = heap_object_field_offset(1);
pub const SOFT_FIELD_FIELD_COUNT: usize = 2;

pub fn get_soft_field_display_name(value: Value) -> Value {
    get_heap_object_field(value, SOFT_FIELD_DISPLAY_NAME_OFFSET)
}

/// Overlay map keyed by holder object, for holders too frozen to store the
/// value themselves.
pub fn get_soft_field_overlay(value: Value) -> Value {
    get_heap_object_field(value, SOFT_FIELD_OVERLAY_OFFSET)
}

pub fn get_soft_field_value(field: Value, holder: Value) -> Result<Value, Condition> {
    if species::in_family(Family::Instance, holder) {
        if let Ok(value) = get_instance_field(holder, field) {
            return Ok(value);
        }
    }
    maps::get_id_hash_map_at(get_soft_field_overlay(field), holder)
}

pub fn set_soft_field_value(
    heap: &mut Heap,
    roots: &Roots,
    field: Value,
    holder: Value,
    value: Value,
) -> Result<(), Condition> {
    if species::in_family(Family::Instance, holder)
        && species::get_value_mode(holder) <= Mode::Mutable
    {
        return try_set_instance_field(heap, roots, holder, field, value);
    }
    maps::set_id_hash_map_at(heap, roots, get_soft_field_overlay(field), holder, value)
}

// ---------------------------------------------------------------------------
// HashSource
// ---------------------------------------------------------------------------
//
// Layout: five raw words of twister state and serial counter, then one value
// field holding the overlay map of bound hash codes.
//
//   [header | s0 s1 mat tmat serial | overlay]

pub const HASH_SOURCE_STATE0_OFFSET: usize = HEAP_OBJECT_HEADER_SIZE;
pub const HASH_SOURCE_STATE1_OFFSET: usize = HEAP_OBJECT_HEADER_SIZE + VALUE_SIZE;
pub const HASH_SOURCE_MAT_OFFSET: usize = HEAP_OBJECT_HEADER_SIZE + 2 * VALUE_SIZE;
pub const HASH_SOURCE_TMAT_OFFSET: usize = HEAP_OBJECT_HEADER_SIZE + 3 * VALUE_SIZE;
pub const HASH_SOURCE_SERIAL_OFFSET: usize = HEAP_OBJECT_HEADER_SIZE + 4 * VALUE_SIZE;
pub const HASH_SOURCE_OVERLAY_OFFSET: usize = HEAP_OBJECT_HEADER_SIZE + 5 * VALUE_SIZE;
pub const HASH_SOURCE_SIZE: usize = HASH_SOURCE_OVERLAY_OFFSET + VALUE_SIZE;

pub fn hash_source_layout(_value: Value) -> HeapObjectLayout {
    HeapObjectLayout::new(HASH_SOURCE_SIZE, HASH_SOURCE_OVERLAY_OFFSET)
}

pub fn init_hash_source_state(source: Value, seed: u64) {
    let addr = source.heap_object_address();
    write_word(addr + HASH_SOURCE_STATE0_OFFSET, seed ^ 0x123456789abcdef);
    write_word(addr + HASH_SOURCE_STATE1_OFFSET, seed.wrapping_mul(6364136223846793005).wrapping_add(1));
    write_word(addr + HASH_SOURCE_MAT_OFFSET, 0xfa051f40_ffb8f909);
    write_word(addr + HASH_SOURCE_TMAT_OFFSET, 0x58d02ffeddbfd76e);
    write_word(addr + HASH_SOURCE_SERIAL_OFFSET, 0);
}

pub fn get_hash_source_overlay(source: Value) -> Value {
    get_heap_object_field(source, HASH_SOURCE_OVERLAY_OFFSET)
}

pub fn set_hash_source_overlay(source: Value, overlay: Value) {
    set_heap_object_field(source, HASH_SOURCE_OVERLAY_OFFSET, overlay);
}

pub fn get_hash_source_serial(source: Value) -> u64 {
    read_word(source.heap_object_address() + HASH_SOURCE_SERIAL_OFFSET)
}

/// Advances the twister and hands out the next code along with its serial.
pub fn hash_source_next(source: Value) -> (u64, u64) {
    let addr = source.heap_object_address();
    let mut s0 = read_word(addr + HASH_SOURCE_STATE0_OFFSET);
    let mut s1 = read_word(addr + HASH_SOURCE_STATE1_OFFSET);
    let mat = read_word(addr + HASH_SOURCE_MAT_OFFSET);
    let tmat = read_word(addr + HASH_SOURCE_TMAT_OFFSET);
    // TinyMT64 step: shift-xor mixing with the mat parameter folded in on
    // odd parity.
    let mut x = (s0 & 0x7fffffffffffffff) ^ s1;
    x ^= x << 12;
    x ^= x >> 32;
    x ^= x << 32;
    x ^= x << 11;
    s0 = s1;
    s1 = x;
    if s1 & 1 != 0 {
        s0 ^= mat >> 32;
        s1 ^= mat << 32;
    }
    write_word(addr + HASH_SOURCE_STATE0_OFFSET, s0);
    write_word(addr + HASH_SOURCE_STATE1_OFFSET, s1);
    // Temper.
    let mut out = s0.wrapping_add(s1);
    out ^= s0 >> 8;
    if out & 1 != 0 {
        out ^= tmat;
    }
    let serial = read_word(addr + HASH_SOURCE_SERIAL_OFFSET);
    write_word(addr + HASH_SOURCE_SERIAL_OFFSET, serial + 1);
    (out, serial)
}

// ---------------------------------------------------------------------------
// HashOracle
// ---------------------------------------------------------------------------

pub const HASH_ORACLE_SOURCE_OFFSET: usize = heap_object_field_offset(0);
pub const HASH_ORACLE_LIMIT_OFFSET: usize = heap_object_field_offset(1);
pub const HASH_ORACLE_FIELD_COUNT: usize = 2;

pub fn get_hash_oracle_source(oracle: Value) -> Value {
    get_heap_object_field(oracle, HASH_ORACLE_SOURCE_OFFSET)
}

pub fn set_hash_oracle_source(oracle: Value, source: Value) {
    set_heap_object_field(oracle, HASH_ORACLE_SOURCE_OFFSET, source);
}

/// Serial limit; nothing while the oracle is mutable, fixed when it freezes.
pub fn get_hash_oracle_limit(oracle: Value) -> Value {
    get_heap_object_field(oracle, HASH_ORACLE_LIMIT_OFFSET)
}

pub fn set_hash_oracle_limit(oracle: Value, limit: Value) {
    set_heap_object_field(oracle, HASH_ORACLE_LIMIT_OFFSET, limit);
}

/// Returns the hash code bound to the value, binding a fresh one when the
/// oracle still may. A frozen oracle only reveals codes bound before its
/// serial limit was fixed.
pub fn hash_oracle_hash_for(
    heap: &mut Heap,
    roots: &Roots,
    oracle: Value,
    value: Value,
) -> Result<Value, Condition> {
    let source = get_hash_oracle_source(oracle);
    let overlay = get_hash_source_overlay(source);
    if let Ok(bound) = maps::get_id_hash_map_at(overlay, value) {
        return Ok(bound);
    }
    let limit = get_hash_oracle_limit(oracle);
    if limit.is_integer() && get_hash_source_serial(source) >= limit.as_integer() as u64 {
        return Err(Condition::new(ConditionCause::InvalidModeChange));
    }
    let (bits, _serial) = hash_source_next(source);
    let code = new_hash_code(bits);
    maps::set_id_hash_map_at(heap, roots, overlay, value, code)?;
    Ok(code)
}

/// Freezing the oracle pins its limit to the source's current serial.
pub fn ensure_hash_oracle_owned_values_frozen(
    _runtime: &mut Runtime,
    oracle: Value,
) -> Result<(), Condition> {
    if !get_hash_oracle_limit(oracle).is_integer() {
        let serial = get_hash_source_serial(get_hash_oracle_source(oracle));
        set_hash_oracle_limit(oracle, Value::new_integer(serial as i64));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Promise
// ---------------------------------------------------------------------------

pub const PROMISE_STATE_OFFSET: usize = heap_object_field_offset(0);
pub const PROMISE_VALUE_OFFSET: usize = heap_object_field_offset(1);
pub const PROMISE_FIELD_COUNT: usize = 2;

pub fn get_promise_state_value(promise: Value) -> PromiseState {
    get_promise_state(get_heap_object_field(promise, PROMISE_STATE_OFFSET))
}

pub fn get_promise_value(promise: Value) -> Value {
    get_heap_object_field(promise, PROMISE_VALUE_OFFSET)
}

pub fn is_promise_settled(promise: Value) -> bool {
    get_promise_state_value(promise) != PromiseState::Pending
}

/// One-shot fulfillment; settling an already settled promise is a no-op.
pub fn fulfill_promise(promise: Value, value: Value) {
    if is_promise_settled(promise) {
        return;
    }
    set_heap_object_field(promise, PROMISE_STATE_OFFSET, new_promise_state(PromiseState::Fulfilled));
    set_heap_object_field(promise, PROMISE_VALUE_OFFSET, value);
}

pub fn reject_promise(promise: Value, error: Value) {
    if is_promise_settled(promise) {
        return;
    }
    set_heap_object_field(promise, PROMISE_STATE_OFFSET, new_promise_state(PromiseState::Rejected));
    set_heap_object_field(promise, PROMISE_VALUE_OFFSET, error);
}

pub fn promise_print_on(promise: Value, context: &mut PrintContext) {
    match get_promise_state_value(promise) {
        PromiseState::Pending => context.buf.push_str("#<pending promise>"),
        PromiseState::Fulfilled => {
            context.buf.push_str("#<fulfilled promise: ");
            context.depth += 1;
            species::value_print_on(get_promise_value(promise), context);
            context.depth -= 1;
            context.buf.push('>');
        }
        PromiseState::Rejected => {
            context.buf.push_str("#<rejected promise: ");
            context.depth += 1;
            species::value_print_on(get_promise_value(promise), context);
            context.depth -= 1;
            context.buf.push('>');
        }
    }
}

// ---------------------------------------------------------------------------
// Identity hashing entry point used by the surface language
// ---------------------------------------------------------------------------

/// Oracle-backed hash of a value: content-hashed families use their transient
/// hash (stable because their content is), everything else gets a bound code.
pub fn oracle_identity_hash(
    heap: &mut Heap,
    roots: &Roots,
    oracle: Value,
    value: Value,
) -> Result<Value, Condition> {
    let stable = match value.domain() {
        crate::core::value::Domain::HeapObject => {
            let behavior =
                species::family_behavior(species::get_heap_object_family(value));
            behavior.transient_identity_hash.is_some()
        }
        _ => true,
    };
    if stable {
        let bits = species::value_transient_identity_hash(value)?;
        return Ok(new_hash_code(bits));
    }
    hash_oracle_hash_for(heap, roots, oracle, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promise_state_phylum_mapping() {
        // Promise settling is exercised end to end in the integration tests;
        // here just the state phylum mapping.
        assert_eq!(
            get_promise_state(new_promise_state(PromiseState::Pending)),
            PromiseState::Pending
        );
        assert_eq!(
            get_promise_state(new_promise_state(PromiseState::Fulfilled)),
            PromiseState::Fulfilled
        );
    }
}
