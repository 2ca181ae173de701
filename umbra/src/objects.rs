/// Simple Value Families — Strings, Blobs, Arrays, Keys, Operations
///
/// Layouts follow the common object shape: header, then non-value data the
/// gc copies untouched, then value fields it owns. Strings and blobs are all
/// non-value payload; arrays are all value payload. Accessors are free
/// functions on `Value` so no reference into the heap survives an allocation.

use std::fmt::Write;

use crate::core::tagged::{self, Relation};
use crate::core::value::{Condition, Value, VALUE_SIZE};
use crate::heap::{
    align_size, get_heap_object_field, heap_object_data_ptr, heap_object_field_offset,
    heap_object_size, set_heap_object_field, Heap, HeapObjectLayout,
};
use crate::runtime::{Roots, Runtime};
use crate::species::{
    self, get_c_object_species_data_size, get_c_object_species_value_count,
    get_heap_object_species, CycleDetector, Family, HashStream, Mode, PrintContext,
};

// ---------------------------------------------------------------------------
// Utf8
// ---------------------------------------------------------------------------

pub const UTF8_LENGTH_OFFSET: usize = heap_object_field_offset(0);
pub const UTF8_CHARS_OFFSET: usize = heap_object_field_offset(1);

/// Size in bytes of a string object with the given number of bytes of
/// content, including the null terminator.
pub const fn calc_utf8_size(byte_count: usize) -> usize {
    UTF8_CHARS_OFFSET + (byte_count + 1 + VALUE_SIZE - 1) / VALUE_SIZE * VALUE_SIZE
}

pub fn get_utf8_length(value: Value) -> usize {
    get_heap_object_field(value, UTF8_LENGTH_OFFSET).as_integer() as usize
}

pub fn set_utf8_length(value: Value, length: usize) {
    set_heap_object_field(value, UTF8_LENGTH_OFFSET, Value::new_integer(length as i64));
}

/// The raw content bytes. The returned slice aliases heap memory; consume it
/// before any allocation can happen.
pub(crate) unsafe fn get_utf8_bytes<'a>(value: Value) -> &'a [u8] {
    let length = get_utf8_length(value);
    std::slice::from_raw_parts(heap_object_data_ptr(value, UTF8_CHARS_OFFSET), length)
}

pub(crate) unsafe fn set_utf8_bytes(value: Value, bytes: &[u8]) {
    let dest = heap_object_data_ptr(value, UTF8_CHARS_OFFSET);
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest, bytes.len());
    *dest.add(bytes.len()) = 0;
}

/// The string contents as an owned Rust string.
pub fn get_utf8_contents(value: Value) -> String {
    debug_assert!(species::in_family(Family::Utf8, value));
    unsafe { String::from_utf8_lossy(get_utf8_bytes(value)).into_owned() }
}

pub fn utf8_equals_str(value: Value, expected: &str) -> bool {
    species::in_family(Family::Utf8, value)
        && unsafe { get_utf8_bytes(value) == expected.as_bytes() }
}

pub fn utf8_layout(value: Value) -> HeapObjectLayout {
    let size = calc_utf8_size(get_utf8_length(value));
    // All payload, no value fields to scan.
    HeapObjectLayout::new(size, size)
}

pub fn utf8_validate(value: Value) -> Result<(), Condition> {
    if !get_heap_object_field(value, UTF8_LENGTH_OFFSET).is_integer() {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

pub fn utf8_print_on(value: Value, context: &mut PrintContext) {
    let _ = write!(context.buf, "{:?}", get_utf8_contents(value));
}

pub fn utf8_transient_identity_hash(
    value: Value,
    stream: &mut HashStream,
    _detector: &mut CycleDetector,
) -> Result<(), Condition> {
    stream.write_u64(get_utf8_length(value) as u64);
    stream.write_bytes(unsafe { get_utf8_bytes(value) });
    Ok(())
}

pub fn utf8_identity_compare(
    a: Value,
    b: Value,
    _detector: &mut CycleDetector,
) -> Result<bool, Condition> {
    Ok(unsafe { get_utf8_bytes(a) == get_utf8_bytes(b) })
}

pub fn utf8_ordering_compare(a: Value, b: Value) -> Value {
    tagged::relation_of(unsafe { get_utf8_bytes(a).cmp(get_utf8_bytes(b)) })
}

// ---------------------------------------------------------------------------
// Blob
// ---------------------------------------------------------------------------

pub const BLOB_LENGTH_OFFSET: usize = heap_object_field_offset(0);
pub const BLOB_DATA_OFFSET: usize = heap_object_field_offset(1);

pub const fn calc_blob_size(byte_count: usize) -> usize {
    BLOB_DATA_OFFSET + (byte_count + VALUE_SIZE - 1) / VALUE_SIZE * VALUE_SIZE
}

pub fn get_blob_length(value: Value) -> usize {
    get_heap_object_field(value, BLOB_LENGTH_OFFSET).as_integer() as usize
}

pub fn set_blob_length(value: Value, length: usize) {
    set_heap_object_field(value, BLOB_LENGTH_OFFSET, Value::new_integer(length as i64));
}

pub(crate) unsafe fn get_blob_bytes<'a>(value: Value) -> &'a mut [u8] {
    let length = get_blob_length(value);
    std::slice::from_raw_parts_mut(heap_object_data_ptr(value, BLOB_DATA_OFFSET), length)
}

pub fn get_blob_data(value: Value) -> Vec<u8> {
    debug_assert!(species::in_family(Family::Blob, value));
    unsafe { get_blob_bytes(value).to_vec() }
}

/// Copies bytes into the blob starting at offset 0; the source must fit.
pub fn blob_fill_from_slice(value: Value, bytes: &[u8]) {
    let dest = unsafe { get_blob_bytes(value) };
    debug_assert!(bytes.len() <= dest.len());
    dest[..bytes.len()].copy_from_slice(bytes);
}

pub fn get_blob_short_at(value: Value, index: usize) -> u16 {
    let bytes = unsafe { get_blob_bytes(value) };
    let at = index * 2;
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

pub fn blob_layout(value: Value) -> HeapObjectLayout {
    let size = calc_blob_size(get_blob_length(value));
    HeapObjectLayout::new(size, size)
}

pub fn blob_validate(value: Value) -> Result<(), Condition> {
    if !get_heap_object_field(value, BLOB_LENGTH_OFFSET).is_integer() {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

pub fn blob_print_on(value: Value, context: &mut PrintContext) {
    let _ = write!(context.buf, "#<blob [{} bytes]>", get_blob_length(value));
}

// ---------------------------------------------------------------------------
// Array
// ---------------------------------------------------------------------------

pub const ARRAY_LENGTH_OFFSET: usize = heap_object_field_offset(0);
pub const ARRAY_ELEMENTS_OFFSET: usize = heap_object_field_offset(1);

pub const fn calc_array_size(length: usize) -> usize {
    ARRAY_ELEMENTS_OFFSET + length * VALUE_SIZE
}

pub fn get_array_length(value: Value) -> usize {
    debug_assert!(species::in_family(Family::Array, value));
    get_heap_object_field(value, ARRAY_LENGTH_OFFSET).as_integer() as usize
}

#[inline]
pub fn get_array_at(value: Value, index: usize) -> Value {
    assert!(index < get_array_length(value), "array index out of bounds");
    get_heap_object_field(value, ARRAY_ELEMENTS_OFFSET + index * VALUE_SIZE)
}

#[inline]
pub fn set_array_at(value: Value, index: usize, element: Value) {
    debug_assert!(species::get_value_mode(value) <= Mode::Mutable);
    set_array_at_raw(value, index, element);
}

/// Write without the mutability check. The collector's in-place map rehash
/// goes through this since it rearranges frozen maps too.
#[inline]
pub(crate) fn set_array_at_raw(value: Value, index: usize, element: Value) {
    assert!(index < get_array_length(value), "array index out of bounds");
    set_heap_object_field(value, ARRAY_ELEMENTS_OFFSET + index * VALUE_SIZE, element);
}

/// Bounds-checked access that surfaces an OutOfBounds condition instead of
/// dying; the builtin surface uses this.
pub fn array_at_checked(value: Value, index: usize) -> Result<Value, Condition> {
    if index >= get_array_length(value) {
        return Err(Condition::out_of_bounds(index));
    }
    Ok(get_heap_object_field(value, ARRAY_ELEMENTS_OFFSET + index * VALUE_SIZE))
}

pub fn array_layout(value: Value) -> HeapObjectLayout {
    let length = get_heap_object_field(value, ARRAY_LENGTH_OFFSET).as_integer() as usize;
    HeapObjectLayout::new(calc_array_size(length), ARRAY_ELEMENTS_OFFSET)
}

pub fn array_validate(value: Value) -> Result<(), Condition> {
    if !get_heap_object_field(value, ARRAY_LENGTH_OFFSET).is_integer() {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

pub fn array_print_on(value: Value, context: &mut PrintContext) {
    context.buf.push('[');
    context.depth += 1;
    for i in 0..get_array_length(value) {
        if i > 0 {
            context.buf.push_str(", ");
        }
        species::value_print_on(get_array_at(value, i), context);
    }
    context.depth -= 1;
    context.buf.push(']');
}

/// Structural hash: length plus element hashes, cycle-protected.
pub fn array_transient_identity_hash(
    value: Value,
    stream: &mut HashStream,
    detector: &mut CycleDetector,
) -> Result<(), Condition> {
    detector.enter(value)?;
    let length = get_array_length(value);
    stream.write_u64(length as u64);
    for i in 0..length {
        species::value_transient_identity_hash_cycle_protect(
            get_array_at(value, i),
            stream,
            detector,
        )?;
    }
    detector.exit();
    Ok(())
}

pub fn array_identity_compare(
    a: Value,
    b: Value,
    detector: &mut CycleDetector,
) -> Result<bool, Condition> {
    let length = get_array_length(a);
    if length != get_array_length(b) {
        return Ok(false);
    }
    detector.enter(a)?;
    let mut result = true;
    for i in 0..length {
        if !species::value_identity_compare_cycle_protect(
            get_array_at(a, i),
            get_array_at(b, i),
            detector,
        )? {
            result = false;
            break;
        }
    }
    detector.exit();
    Ok(result)
}

// ── Pair arrays ──────────────────────────────────────────────────────────────
//
// A pair array is an even-length array of alternating keys and values, kept
// sorted by key in the value ordering. Signature tags and call tags entries
// are pair arrays, which is what lets matching scan two sorted sequences in
// lockstep.

pub fn get_pair_array_length(value: Value) -> usize {
    get_array_length(value) / 2
}

pub fn get_pair_array_first_at(value: Value, index: usize) -> Value {
    get_array_at(value, index * 2)
}

pub fn get_pair_array_second_at(value: Value, index: usize) -> Value {
    get_array_at(value, index * 2 + 1)
}

pub fn set_pair_array_first_at(value: Value, index: usize, element: Value) {
    set_array_at(value, index * 2, element);
}

pub fn set_pair_array_second_at(value: Value, index: usize, element: Value) {
    set_array_at(value, index * 2 + 1, element);
}

/// Sorts the pairs by their first component. Insertion sort; pair arrays are
/// signature-sized.
pub fn co_sort_pair_array(value: Value) {
    let length = get_pair_array_length(value);
    for i in 1..length {
        let mut j = i;
        while j > 0 {
            let prev = get_pair_array_first_at(value, j - 1);
            let here = get_pair_array_first_at(value, j);
            let relation = species::value_ordering_compare(prev, here);
            if !tagged::test_relation(relation, Relation::GreaterThan as u64) {
                break;
            }
            swap_pair(value, j - 1, j);
            j -= 1;
        }
    }
}

fn swap_pair(value: Value, i: usize, j: usize) {
    let (ik, iv) = (get_pair_array_first_at(value, i), get_pair_array_second_at(value, i));
    let (jk, jv) = (get_pair_array_first_at(value, j), get_pair_array_second_at(value, j));
    set_pair_array_first_at(value, i, jk);
    set_pair_array_second_at(value, i, jv);
    set_pair_array_first_at(value, j, ik);
    set_pair_array_second_at(value, j, iv);
}

pub fn is_pair_array_sorted(value: Value) -> bool {
    let length = get_pair_array_length(value);
    for i in 1..length {
        let prev = get_pair_array_first_at(value, i - 1);
        let here = get_pair_array_first_at(value, i);
        let relation = species::value_ordering_compare(prev, here);
        if tagged::test_relation(relation, Relation::GreaterThan as u64) {
            return false;
        }
    }
    true
}

/// Binary search on a sorted pair array, comparing by identity after the
/// ordering narrows to one slot. Returns the value component.
pub fn binary_search_pair_array(value: Value, key: Value) -> Option<Value> {
    let length = get_pair_array_length(value);
    let mut lo = 0;
    let mut hi = length;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let mid_key = get_pair_array_first_at(value, mid);
        let relation = species::value_ordering_compare(mid_key, key);
        if tagged::test_relation(relation, Relation::LessThan as u64) {
            lo = mid + 1;
        } else if tagged::test_relation(relation, Relation::GreaterThan as u64) {
            hi = mid;
        } else {
            return Some(get_pair_array_second_at(value, mid));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// ArrayBuffer
// ---------------------------------------------------------------------------

pub const ARRAY_BUFFER_ELEMENTS_OFFSET: usize = heap_object_field_offset(0);
pub const ARRAY_BUFFER_LENGTH_OFFSET: usize = heap_object_field_offset(1);
pub const ARRAY_BUFFER_FIELD_COUNT: usize = 2;

pub fn get_array_buffer_elements(value: Value) -> Value {
    get_heap_object_field(value, ARRAY_BUFFER_ELEMENTS_OFFSET)
}

pub fn set_array_buffer_elements(value: Value, elements: Value) {
    set_heap_object_field(value, ARRAY_BUFFER_ELEMENTS_OFFSET, elements);
}

pub fn get_array_buffer_length(value: Value) -> usize {
    get_heap_object_field(value, ARRAY_BUFFER_LENGTH_OFFSET).as_integer() as usize
}

pub fn set_array_buffer_length(value: Value, length: usize) {
    set_heap_object_field(value, ARRAY_BUFFER_LENGTH_OFFSET, Value::new_integer(length as i64));
}

pub fn get_array_buffer_at(value: Value, index: usize) -> Value {
    assert!(index < get_array_buffer_length(value), "buffer index out of bounds");
    get_array_at(get_array_buffer_elements(value), index)
}

pub fn set_array_buffer_at(value: Value, index: usize, element: Value) {
    assert!(index < get_array_buffer_length(value), "buffer index out of bounds");
    set_array_at(get_array_buffer_elements(value), index, element);
}

/// Appends, doubling the backing array on overflow. May fail with
/// HeapExhausted, in which case the buffer is unchanged.
pub fn add_to_array_buffer(
    heap: &mut Heap,
    roots: &Roots,
    buffer: Value,
    element: Value,
) -> Result<(), Condition> {
    let length = get_array_buffer_length(buffer);
    let elements = get_array_buffer_elements(buffer);
    let capacity = get_array_length(elements);
    if length == capacity {
        let new_capacity = if capacity == 0 { 4 } else { capacity * 2 };
        let new_elements = crate::alloc::new_heap_array(heap, roots, new_capacity)?;
        for i in 0..length {
            set_array_at(new_elements, i, get_array_at(elements, i));
        }
        set_array_buffer_elements(buffer, new_elements);
    }
    let elements = get_array_buffer_elements(buffer);
    set_array_at(elements, length, element);
    set_array_buffer_length(buffer, length + 1);
    Ok(())
}

pub fn in_array_buffer(buffer: Value, element: Value) -> bool {
    for i in 0..get_array_buffer_length(buffer) {
        if get_array_buffer_at(buffer, i) == element {
            return true;
        }
    }
    false
}

pub fn array_buffer_validate(value: Value) -> Result<(), Condition> {
    if !species::in_family(Family::Array, get_array_buffer_elements(value)) {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

pub fn ensure_array_buffer_owned_values_frozen(
    runtime: &mut Runtime,
    value: Value,
) -> Result<(), Condition> {
    species::ensure_frozen(runtime, get_array_buffer_elements(value))
}

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

pub const KEY_ID_OFFSET: usize = heap_object_field_offset(0);
pub const KEY_DISPLAY_NAME_OFFSET: usize = heap_object_field_offset(1);
pub const KEY_FIELD_COUNT: usize = 2;

pub fn get_key_id(value: Value) -> i64 {
    get_heap_object_field(value, KEY_ID_OFFSET).as_integer()
}

pub fn set_key_id(value: Value, id: i64) {
    set_heap_object_field(value, KEY_ID_OFFSET, Value::new_integer(id));
}

pub fn get_key_display_name(value: Value) -> Value {
    get_heap_object_field(value, KEY_DISPLAY_NAME_OFFSET)
}

pub fn set_key_display_name(value: Value, name: Value) {
    set_heap_object_field(value, KEY_DISPLAY_NAME_OFFSET, name);
}

pub fn key_print_on(value: Value, context: &mut PrintContext) {
    let name = get_key_display_name(value);
    if tagged::is_nothing(name) {
        let _ = write!(context.buf, "%<key {}>", get_key_id(value));
    } else {
        let _ = write!(context.buf, "%{}", get_utf8_contents(name));
    }
}

/// Keys compare and hash by id, so key identity is stable across gc.
pub fn key_transient_identity_hash(
    value: Value,
    stream: &mut HashStream,
    _detector: &mut CycleDetector,
) -> Result<(), Condition> {
    stream.write_u64(get_key_id(value) as u64);
    Ok(())
}

pub fn key_ordering_compare(a: Value, b: Value) -> Value {
    tagged::relation_of(get_key_id(a).cmp(&get_key_id(b)))
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// What flavor of selector an invocation used; drives how a call is printed
/// in backtraces.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    /// `a := b`
    Assign = 0,
    /// `a()`
    Call = 1,
    /// `a[b]`
    Index = 2,
    /// `a + b`
    Infix = 3,
    /// `!a`
    Prefix = 4,
    /// `a!`
    Suffix = 5,
    /// `a.foo`
    Property = 6,
}

impl OperationType {
    pub fn from_raw(raw: i64) -> OperationType {
        match raw {
            0 => OperationType::Assign,
            1 => OperationType::Call,
            2 => OperationType::Index,
            3 => OperationType::Infix,
            4 => OperationType::Prefix,
            5 => OperationType::Suffix,
            _ => OperationType::Property,
        }
    }
}

pub const OPERATION_TYPE_OFFSET: usize = heap_object_field_offset(0);
pub const OPERATION_VALUE_OFFSET: usize = heap_object_field_offset(1);
pub const OPERATION_FIELD_COUNT: usize = 2;

pub fn get_operation_type(value: Value) -> OperationType {
    OperationType::from_raw(get_heap_object_field(value, OPERATION_TYPE_OFFSET).as_integer())
}

pub fn set_operation_type(value: Value, operation_type: OperationType) {
    set_heap_object_field(value, OPERATION_TYPE_OFFSET, Value::new_integer(operation_type as i64));
}

pub fn get_operation_value(value: Value) -> Value {
    get_heap_object_field(value, OPERATION_VALUE_OFFSET)
}

pub fn set_operation_value(value: Value, payload: Value) {
    set_heap_object_field(value, OPERATION_VALUE_OFFSET, payload);
}

pub fn operation_print_on(value: Value, context: &mut PrintContext) {
    print_operation_open(value, context);
    print_operation_close(value, context);
}

/// The part of the operation that prints before the arguments.
pub fn print_operation_open(value: Value, context: &mut PrintContext) {
    match get_operation_type(value) {
        OperationType::Assign => {
            species::value_print_on(get_operation_value(value), context);
            context.buf.push_str(":=");
        }
        OperationType::Call => context.buf.push('('),
        OperationType::Index => context.buf.push('['),
        OperationType::Infix => {
            context.buf.push('.');
            print_operation_name(value, context);
            context.buf.push('(');
        }
        OperationType::Prefix => {
            print_operation_name(value, context);
            context.buf.push('(');
        }
        OperationType::Suffix => context.buf.push('('),
        OperationType::Property => context.buf.push('.'),
    }
}

/// The part of the operation that prints after the arguments.
pub fn print_operation_close(value: Value, context: &mut PrintContext) {
    match get_operation_type(value) {
        OperationType::Assign => {}
        OperationType::Call | OperationType::Infix | OperationType::Prefix => {
            context.buf.push(')')
        }
        OperationType::Index => context.buf.push(']'),
        OperationType::Suffix => {
            context.buf.push(')');
            print_operation_name(value, context);
        }
        OperationType::Property => print_operation_name(value, context),
    }
}

fn print_operation_name(value: Value, context: &mut PrintContext) {
    let name = get_operation_value(value);
    if species::in_family(Family::Utf8, name) {
        context.buf.push_str(&get_utf8_contents(name));
    } else {
        species::value_print_on(name, context);
    }
}

pub fn operation_transient_identity_hash(
    value: Value,
    stream: &mut HashStream,
    detector: &mut CycleDetector,
) -> Result<(), Condition> {
    stream.write_u64(get_operation_type(value) as u64);
    species::value_transient_identity_hash_cycle_protect(
        get_operation_value(value),
        stream,
        detector,
    )
}

pub fn operation_identity_compare(
    a: Value,
    b: Value,
    detector: &mut CycleDetector,
) -> Result<bool, Condition> {
    if get_operation_type(a) != get_operation_type(b) {
        return Ok(false);
    }
    species::value_identity_compare_cycle_protect(
        get_operation_value(a),
        get_operation_value(b),
        detector,
    )
}

// ---------------------------------------------------------------------------
// Reference
// ---------------------------------------------------------------------------

pub const REFERENCE_VALUE_OFFSET: usize = heap_object_field_offset(0);
pub const REFERENCE_FIELD_COUNT: usize = 1;

pub fn get_reference_value(value: Value) -> Value {
    get_heap_object_field(value, REFERENCE_VALUE_OFFSET)
}

pub fn set_reference_value(value: Value, referent: Value) {
    set_heap_object_field(value, REFERENCE_VALUE_OFFSET, referent);
}

// ---------------------------------------------------------------------------
// VoidP
// ---------------------------------------------------------------------------

pub const VOID_P_VALUE_OFFSET: usize = heap_object_field_offset(0);

pub fn void_p_layout(_value: Value) -> HeapObjectLayout {
    let size = heap_object_size(1);
    // One raw pointer word; nothing for the gc to scan.
    HeapObjectLayout::new(size, size)
}

pub fn get_void_p_value(value: Value) -> usize {
    debug_assert!(species::in_family(Family::VoidP, value));
    crate::heap::read_word(value.heap_object_address() + VOID_P_VALUE_OFFSET) as usize
}

pub fn set_void_p_value(value: Value, ptr: usize) {
    crate::heap::write_word(value.heap_object_address() + VOID_P_VALUE_OFFSET, ptr as u64);
}

// ---------------------------------------------------------------------------
// CObject
// ---------------------------------------------------------------------------

pub fn c_object_layout(value: Value) -> HeapObjectLayout {
    let species = get_heap_object_species(value);
    let data_size = align_size(VALUE_SIZE, get_c_object_species_data_size(species));
    let value_count = get_c_object_species_value_count(species);
    let value_offset = crate::heap::HEAP_OBJECT_HEADER_SIZE + data_size;
    HeapObjectLayout::new(value_offset + value_count * VALUE_SIZE, value_offset)
}

pub fn get_c_object_data_ptr(value: Value) -> *mut u8 {
    heap_object_data_ptr(value, crate::heap::HEAP_OBJECT_HEADER_SIZE)
}

pub fn get_c_object_value_at(value: Value, index: usize) -> Value {
    let layout = c_object_layout(value);
    assert!(index < get_c_object_species_value_count(get_heap_object_species(value)));
    get_heap_object_field(value, layout.value_offset + index * VALUE_SIZE)
}

pub fn set_c_object_value_at(value: Value, index: usize, element: Value) {
    let layout = c_object_layout(value);
    assert!(index < get_c_object_species_value_count(get_heap_object_species(value)));
    set_heap_object_field(value, layout.value_offset + index * VALUE_SIZE, element);
}
