/// Heap Constructors
///
/// One constructor per family. All of them allocate exactly what they are
/// asked for and initialize every field before returning; on exhaustion they
/// return the HeapExhausted condition untouched so the collection retry loop
/// upstream can do its job. None of them collect.

use crate::core::tagged::{new_boolean, new_flag_set, new_promise_state, nothing, null, PromiseState};
use crate::core::value::{Condition, Value, VALUE_SIZE};
use crate::heap::{
    heap_object_size, set_heap_object_field, set_heap_object_header, write_word, Heap,
};
use crate::objects;
use crate::runtime::Roots;
use crate::species::{self, Family, Mode};
use crate::stack::{self, frame_flags, Frame};

fn alloc_object(heap: &mut Heap, size: usize, species: Value) -> Result<Value, Condition> {
    let addr = heap.try_alloc(size)?;
    let obj = Value::new_heap_object(addr);
    set_heap_object_header(obj, species);
    Ok(obj)
}

// ---------------------------------------------------------------------------
// Strings, blobs, arrays
// ---------------------------------------------------------------------------

pub fn new_heap_utf8(heap: &mut Heap, roots: &Roots, contents: &str) -> Result<Value, Condition> {
    let bytes = contents.as_bytes();
    let size = objects::calc_utf8_size(bytes.len());
    let result = alloc_object(heap, size, roots.species_for(Family::Utf8))?;
    objects::set_utf8_length(result, bytes.len());
    unsafe { objects::set_utf8_bytes(result, bytes) };
    Ok(result)
}

pub fn new_heap_blob(heap: &mut Heap, roots: &Roots, length: usize) -> Result<Value, Condition> {
    let size = objects::calc_blob_size(length);
    let result = alloc_object(heap, size, roots.species_for(Family::Blob))?;
    objects::set_blob_length(result, length);
    unsafe {
        for byte in objects::get_blob_bytes(result) {
            *byte = 0;
        }
    }
    Ok(result)
}

pub fn new_heap_blob_with_data(
    heap: &mut Heap,
    roots: &Roots,
    bytes: &[u8],
) -> Result<Value, Condition> {
    let result = new_heap_blob(heap, roots, bytes.len())?;
    objects::blob_fill_from_slice(result, bytes);
    Ok(result)
}

pub fn new_heap_array(heap: &mut Heap, roots: &Roots, length: usize) -> Result<Value, Condition> {
    let size = objects::calc_array_size(length);
    let result = alloc_object(heap, size, roots.modal_species(Family::Array, Mode::Mutable))?;
    set_heap_object_field(result, objects::ARRAY_LENGTH_OFFSET, Value::new_integer(length as i64));
    for i in 0..length {
        set_heap_object_field(
            result,
            objects::ARRAY_ELEMENTS_OFFSET + i * VALUE_SIZE,
            null(),
        );
    }
    Ok(result)
}

pub fn new_heap_array_with(
    heap: &mut Heap,
    roots: &Roots,
    elements: &[Value],
) -> Result<Value, Condition> {
    let result = new_heap_array(heap, roots, elements.len())?;
    for (i, &element) in elements.iter().enumerate() {
        objects::set_array_at(result, i, element);
    }
    Ok(result)
}

pub fn new_heap_array_buffer(
    heap: &mut Heap,
    roots: &Roots,
    capacity: usize,
) -> Result<Value, Condition> {
    let elements = new_heap_array(heap, roots, capacity)?;
    let result = alloc_object(
        heap,
        heap_object_size(objects::ARRAY_BUFFER_FIELD_COUNT),
        roots.modal_species(Family::ArrayBuffer, Mode::Mutable),
    )?;
    objects::set_array_buffer_elements(result, elements);
    objects::set_array_buffer_length(result, 0);
    Ok(result)
}

// ---------------------------------------------------------------------------
// Maps and buffers
// ---------------------------------------------------------------------------

pub fn new_heap_id_hash_map(
    heap: &mut Heap,
    roots: &Roots,
    capacity: usize,
) -> Result<Value, Condition> {
    let entries = new_heap_array(heap, roots, capacity * crate::maps::ID_HASH_MAP_ENTRY_FIELD_COUNT)?;
    for i in 0..objects::get_array_length(entries) {
        objects::set_array_at(entries, i, nothing());
    }
    let result = alloc_object(
        heap,
        heap_object_size(crate::maps::ID_HASH_MAP_FIELD_COUNT),
        roots.modal_species(Family::IdHashMap, Mode::Mutable),
    )?;
    crate::maps::set_id_hash_map_entry_array(result, entries);
    crate::maps::set_id_hash_map_size(result, 0);
    crate::maps::set_id_hash_map_capacity(result, capacity);
    crate::maps::set_id_hash_map_occupied_count(result, 0);
    Ok(result)
}

pub fn new_heap_fifo_buffer(
    heap: &mut Heap,
    roots: &Roots,
    width: usize,
    capacity: usize,
) -> Result<Value, Condition> {
    let nodes =
        new_heap_array(heap, roots, crate::maps::fifo_buffer_nodes_length(width, capacity))?;
    let result = alloc_object(
        heap,
        heap_object_size(crate::maps::FIFO_BUFFER_FIELD_COUNT),
        roots.species_for(Family::FifoBuffer),
    )?;
    crate::maps::set_fifo_buffer_nodes(result, nodes);
    crate::maps::set_fifo_buffer_width(result, width);
    crate::maps::set_fifo_buffer_size(result, 0);
    crate::maps::init_fifo_buffer_links(result);
    Ok(result)
}

// ---------------------------------------------------------------------------
// Keys, operations, references, native wrappers
// ---------------------------------------------------------------------------

pub fn new_heap_key(
    heap: &mut Heap,
    roots: &Roots,
    id: i64,
    display_name: Value,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(objects::KEY_FIELD_COUNT),
        roots.modal_species(Family::Key, Mode::Mutable),
    )?;
    objects::set_key_id(result, id);
    objects::set_key_display_name(result, display_name);
    Ok(result)
}

pub fn new_heap_operation(
    heap: &mut Heap,
    roots: &Roots,
    operation_type: objects::OperationType,
    value: Value,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(objects::OPERATION_FIELD_COUNT),
        roots.modal_species(Family::Operation, Mode::Mutable),
    )?;
    objects::set_operation_type(result, operation_type);
    objects::set_operation_value(result, value);
    Ok(result)
}

pub fn new_heap_reference(heap: &mut Heap, roots: &Roots, value: Value) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(objects::REFERENCE_FIELD_COUNT),
        roots.modal_species(Family::Reference, Mode::Mutable),
    )?;
    objects::set_reference_value(result, value);
    Ok(result)
}

pub fn new_heap_void_p(heap: &mut Heap, roots: &Roots, ptr: usize) -> Result<Value, Condition> {
    let result = alloc_object(heap, heap_object_size(1), roots.species_for(Family::VoidP))?;
    objects::set_void_p_value(result, ptr);
    Ok(result)
}

pub fn new_heap_c_object(heap: &mut Heap, species: Value) -> Result<Value, Condition> {
    let data_size = crate::heap::align_size(
        VALUE_SIZE,
        species::get_c_object_species_data_size(species),
    );
    let value_count = species::get_c_object_species_value_count(species);
    let size = crate::heap::HEAP_OBJECT_HEADER_SIZE + data_size + value_count * VALUE_SIZE;
    let result = alloc_object(heap, size, species)?;
    unsafe {
        std::ptr::write_bytes(objects::get_c_object_data_ptr(result), 0, data_size);
    }
    for i in 0..value_count {
        objects::set_c_object_value_at(result, i, nothing());
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Code blocks
// ---------------------------------------------------------------------------

pub fn new_heap_code_block(
    heap: &mut Heap,
    roots: &Roots,
    bytecode: Value,
    value_pool: Value,
    high_water_mark: usize,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::bytecode::CODE_BLOCK_FIELD_COUNT),
        roots.modal_species(Family::CodeBlock, Mode::Mutable),
    )?;
    set_heap_object_field(result, crate::bytecode::CODE_BLOCK_BYTECODE_OFFSET, bytecode);
    set_heap_object_field(result, crate::bytecode::CODE_BLOCK_VALUE_POOL_OFFSET, value_pool);
    crate::bytecode::set_code_block_high_water_mark(result, high_water_mark);
    Ok(result)
}

// ---------------------------------------------------------------------------
// Stacks
// ---------------------------------------------------------------------------

/// Allocates a stack piece and seeds it closed: a synthetic empty frame
/// (marked stack-bottom when there is no previous piece) under a lid.
pub fn new_heap_stack_piece(
    heap: &mut Heap,
    roots: &Roots,
    capacity: usize,
    previous: Value,
    stack: Value,
) -> Result<Value, Condition> {
    debug_assert!(capacity >= 2 * stack::FRAME_HEADER_FIELD_COUNT);
    let size = stack::calc_stack_piece_size(capacity);
    let result = alloc_object(heap, size, roots.species_for(Family::StackPiece))?;
    set_heap_object_field(
        result,
        stack::STACK_PIECE_CAPACITY_OFFSET,
        Value::new_integer(capacity as i64),
    );
    stack::set_stack_piece_previous(result, previous);
    stack::set_stack_piece_stack(result, stack);
    // Not an integer, so the piece reads as open while it is being seeded.
    stack::set_stack_piece_lid_frame_pointer(result, nothing());
    let storage = stack::get_stack_piece_storage_start(result);
    for i in 0..capacity {
        write_word(storage + i * VALUE_SIZE, nothing().raw());
    }
    let mut frame = Frame {
        stack_pointer: storage,
        frame_pointer: storage,
        limit_pointer: storage,
        flags: new_flag_set(frame_flags::SYNTHETIC | frame_flags::STACK_PIECE_EMPTY),
        stack_piece: result,
        pc: 0,
    };
    stack::close_frame(&mut frame);
    Ok(result)
}

pub fn new_heap_stack(
    heap: &mut Heap,
    roots: &Roots,
    default_piece_capacity: usize,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(stack::STACK_FIELD_COUNT),
        roots.species_for(Family::Stack),
    )?;
    set_heap_object_field(
        result,
        stack::STACK_DEFAULT_PIECE_CAPACITY_OFFSET,
        Value::new_integer(default_piece_capacity as i64),
    );
    stack::set_stack_top_barrier(result, nothing());
    stack::set_stack_top_piece(result, nothing());
    let piece = new_heap_stack_piece(heap, roots, default_piece_capacity, nothing(), result)?;
    stack::set_stack_top_piece(result, piece);
    // Seed the bottom frame whose code catches the final return.
    let bottom_code = roots.stack_bottom_code_block();
    let mut frame = stack::Frame::empty();
    stack::open_stack_piece(piece, &mut frame);
    let pushed = stack::try_push_new_frame(
        &mut frame,
        crate::bytecode::get_code_block_high_water_mark(bottom_code),
        frame_flags::SYNTHETIC | frame_flags::STACK_BOTTOM,
        false,
    );
    debug_assert!(pushed, "seeding stack bottom frame");
    frame.set_code_block(bottom_code);
    frame.set_argument_map(roots.empty_array());
    stack::close_frame(&mut frame);
    Ok(result)
}

// ---------------------------------------------------------------------------
// Closures
// ---------------------------------------------------------------------------

pub fn new_heap_lambda(
    heap: &mut Heap,
    roots: &Roots,
    methods: Value,
    captures: Value,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::closures::LAMBDA_FIELD_COUNT),
        roots.modal_species(Family::Lambda, Mode::Mutable),
    )?;
    crate::closures::set_lambda_methods(result, methods);
    crate::closures::set_lambda_captures(result, captures);
    Ok(result)
}

pub fn new_heap_block(heap: &mut Heap, roots: &Roots, section: Value) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::closures::BLOCK_FIELD_COUNT),
        roots.modal_species(Family::Block, Mode::Mutable),
    )?;
    crate::closures::set_block_section(result, section);
    Ok(result)
}

pub fn new_heap_escape(heap: &mut Heap, roots: &Roots, section: Value) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::closures::ESCAPE_FIELD_COUNT),
        roots.species_for(Family::Escape),
    )?;
    crate::closures::set_escape_section(result, section);
    Ok(result)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub fn new_heap_signature(
    heap: &mut Heap,
    roots: &Roots,
    tags: Value,
    parameter_count: usize,
    mandatory_count: usize,
    allow_extra: bool,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::method::SIGNATURE_FIELD_COUNT),
        roots.modal_species(Family::Signature, Mode::Mutable),
    )?;
    crate::method::set_signature_tags(result, tags);
    crate::method::set_signature_parameter_count(result, parameter_count);
    crate::method::set_signature_mandatory_count(result, mandatory_count);
    crate::method::set_signature_allow_extra(result, allow_extra);
    Ok(result)
}

pub fn new_heap_parameter(
    heap: &mut Heap,
    roots: &Roots,
    guard: Value,
    tags: Value,
    is_optional: bool,
    index: usize,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::method::PARAMETER_FIELD_COUNT),
        roots.modal_species(Family::Parameter, Mode::Mutable),
    )?;
    set_heap_object_field(result, crate::method::PARAMETER_GUARD_OFFSET, guard);
    set_heap_object_field(result, crate::method::PARAMETER_TAGS_OFFSET, tags);
    set_heap_object_field(
        result,
        crate::method::PARAMETER_IS_OPTIONAL_OFFSET,
        new_boolean(is_optional),
    );
    set_heap_object_field(
        result,
        crate::method::PARAMETER_INDEX_OFFSET,
        Value::new_integer(index as i64),
    );
    Ok(result)
}

pub fn new_heap_guard(
    heap: &mut Heap,
    roots: &Roots,
    guard_type: crate::method::GuardType,
    value: Value,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::method::GUARD_FIELD_COUNT),
        roots.modal_species(Family::Guard, Mode::Mutable),
    )?;
    set_heap_object_field(
        result,
        crate::method::GUARD_TYPE_OFFSET,
        Value::new_integer(guard_type as i64),
    );
    set_heap_object_field(result, crate::method::GUARD_VALUE_OFFSET, value);
    Ok(result)
}

pub fn new_heap_call_tags(heap: &mut Heap, roots: &Roots, entries: Value) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::method::CALL_TAGS_FIELD_COUNT),
        roots.modal_species(Family::CallTags, Mode::Mutable),
    )?;
    crate::method::set_call_tags_entries(result, entries);
    Ok(result)
}

pub fn new_heap_call_data(
    heap: &mut Heap,
    roots: &Roots,
    tags: Value,
    values: Value,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::method::CALL_DATA_FIELD_COUNT),
        roots.modal_species(Family::CallData, Mode::Mutable),
    )?;
    set_heap_object_field(result, crate::method::CALL_DATA_TAGS_OFFSET, tags);
    set_heap_object_field(result, crate::method::CALL_DATA_VALUES_OFFSET, values);
    Ok(result)
}

pub fn new_heap_method(
    heap: &mut Heap,
    roots: &Roots,
    signature: Value,
    code: Value,
    syntax: Value,
    fragment: Value,
    flags: u64,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::method::METHOD_FIELD_COUNT),
        roots.modal_species(Family::Method, Mode::Mutable),
    )?;
    set_heap_object_field(result, crate::method::METHOD_SIGNATURE_OFFSET, signature);
    set_heap_object_field(result, crate::method::METHOD_CODE_OFFSET, code);
    set_heap_object_field(result, crate::method::METHOD_SYNTAX_OFFSET, syntax);
    set_heap_object_field(result, crate::method::METHOD_MODULE_FRAGMENT_OFFSET, fragment);
    set_heap_object_field(result, crate::method::METHOD_FLAGS_OFFSET, new_flag_set(flags));
    Ok(result)
}

pub fn new_heap_signature_map(heap: &mut Heap, roots: &Roots) -> Result<Value, Condition> {
    let entries = new_heap_array_buffer(heap, roots, 16)?;
    let result = alloc_object(
        heap,
        heap_object_size(crate::method::SIGNATURE_MAP_FIELD_COUNT),
        roots.modal_species(Family::SignatureMap, Mode::Mutable),
    )?;
    set_heap_object_field(result, crate::method::SIGNATURE_MAP_ENTRIES_OFFSET, entries);
    Ok(result)
}

pub fn new_heap_methodspace(heap: &mut Heap, roots: &Roots) -> Result<Value, Condition> {
    let inheritance = new_heap_id_hash_map(heap, roots, 16)?;
    let methods = new_heap_signature_map(heap, roots)?;
    let imports = new_heap_array_buffer(heap, roots, 4)?;
    let result = alloc_object(
        heap,
        heap_object_size(crate::method::METHODSPACE_FIELD_COUNT),
        roots.modal_species(Family::Methodspace, Mode::Mutable),
    )?;
    set_heap_object_field(result, crate::method::METHODSPACE_INHERITANCE_OFFSET, inheritance);
    set_heap_object_field(result, crate::method::METHODSPACE_METHODS_OFFSET, methods);
    set_heap_object_field(result, crate::method::METHODSPACE_IMPORTS_OFFSET, imports);
    Ok(result)
}

pub fn new_heap_ambience(heap: &mut Heap, roots: &Roots, methodspace: Value) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::method::AMBIENCE_FIELD_COUNT),
        roots.species_for(Family::Ambience),
    )?;
    crate::method::set_ambience_methodspace(result, methodspace);
    Ok(result)
}

pub fn new_heap_argument_map_trie(
    heap: &mut Heap,
    roots: &Roots,
    value: Value,
) -> Result<Value, Condition> {
    let children = new_heap_array_buffer(heap, roots, 4)?;
    let result = alloc_object(
        heap,
        heap_object_size(crate::method::ARGUMENT_MAP_TRIE_FIELD_COUNT),
        roots.modal_species(Family::ArgumentMapTrie, Mode::Mutable),
    )?;
    crate::method::set_argument_map_trie_value(result, value);
    set_heap_object_field(result, crate::method::ARGUMENT_MAP_TRIE_CHILDREN_OFFSET, children);
    Ok(result)
}

// ---------------------------------------------------------------------------
// Instances and identity
// ---------------------------------------------------------------------------

pub fn new_heap_type(heap: &mut Heap, roots: &Roots, display_name: Value) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::instance::TYPE_FIELD_COUNT),
        roots.modal_species(Family::Type, Mode::Mutable),
    )?;
    crate::instance::set_type_display_name(result, display_name);
    Ok(result)
}

pub fn new_heap_instance_species(
    heap: &mut Heap,
    roots: &Roots,
    primary_type: Value,
    manager: Value,
    mode: Mode,
    derivatives: Value,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        species::species_size(species::Division::Instance),
        roots.species_for(Family::Species),
    )?;
    set_heap_object_field(
        result,
        species::SPECIES_FAMILY_OFFSET,
        Value::new_integer(Family::Instance.ordinal() as i64),
    );
    set_heap_object_field(
        result,
        species::SPECIES_BEHAVIOR_OFFSET,
        Value::new_integer(Family::Instance.ordinal() as i64),
    );
    set_heap_object_field(
        result,
        species::SPECIES_DIVISION_OFFSET,
        Value::new_integer(species::Division::Instance as i64),
    );
    species::set_instance_species_primary_type(result, primary_type);
    species::set_instance_species_manager(result, manager);
    species::set_instance_species_raw_mode(result, mode);
    species::set_instance_species_derivatives(result, derivatives);
    Ok(result)
}

pub fn new_heap_instance(heap: &mut Heap, roots: &Roots, species_value: Value) -> Result<Value, Condition> {
    let fields = new_heap_id_hash_map(heap, roots, 16)?;
    let result = alloc_object(
        heap,
        heap_object_size(crate::instance::INSTANCE_FIELD_COUNT),
        species_value,
    )?;
    crate::instance::set_instance_fields(result, fields);
    Ok(result)
}

pub fn new_heap_instance_manager(
    heap: &mut Heap,
    roots: &Roots,
    display_name: Value,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::instance::INSTANCE_MANAGER_FIELD_COUNT),
        roots.species_for(Family::InstanceManager),
    )?;
    set_heap_object_field(
        result,
        crate::instance::INSTANCE_MANAGER_DISPLAY_NAME_OFFSET,
        display_name,
    );
    Ok(result)
}

pub fn new_heap_hard_field(
    heap: &mut Heap,
    roots: &Roots,
    display_name: Value,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::instance::HARD_FIELD_FIELD_COUNT),
        roots.species_for(Family::HardField),
    )?;
    set_heap_object_field(result, crate::instance::HARD_FIELD_DISPLAY_NAME_OFFSET, display_name);
    Ok(result)
}

pub fn new_heap_soft_field(
    heap: &mut Heap,
    roots: &Roots,
    display_name: Value,
) -> Result<Value, Condition> {
    let overlay = new_heap_id_hash_map(heap, roots, 16)?;
    let result = alloc_object(
        heap,
        heap_object_size(crate::instance::SOFT_FIELD_FIELD_COUNT),
        roots.species_for(Family::SoftField),
    )?;
    set_heap_object_field(result, crate::instance::SOFT_FIELD_DISPLAY_NAME_OFFSET, display_name);
    set_heap_object_field(result, crate::instance::SOFT_FIELD_OVERLAY_OFFSET, overlay);
    Ok(result)
}

pub fn new_heap_hash_source(heap: &mut Heap, roots: &Roots, seed: u64) -> Result<Value, Condition> {
    let overlay = new_heap_id_hash_map(heap, roots, 16)?;
    let result = alloc_object(
        heap,
        crate::instance::HASH_SOURCE_SIZE,
        roots.species_for(Family::HashSource),
    )?;
    crate::instance::init_hash_source_state(result, seed);
    crate::instance::set_hash_source_overlay(result, overlay);
    Ok(result)
}

pub fn new_heap_hash_oracle(heap: &mut Heap, roots: &Roots, source: Value) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::instance::HASH_ORACLE_FIELD_COUNT),
        roots.modal_species(Family::HashOracle, Mode::Mutable),
    )?;
    crate::instance::set_hash_oracle_source(result, source);
    crate::instance::set_hash_oracle_limit(result, nothing());
    Ok(result)
}

pub fn new_heap_promise(heap: &mut Heap, roots: &Roots) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::instance::PROMISE_FIELD_COUNT),
        roots.species_for(Family::Promise),
    )?;
    set_heap_object_field(
        result,
        crate::instance::PROMISE_STATE_OFFSET,
        new_promise_state(PromiseState::Pending),
    );
    set_heap_object_field(result, crate::instance::PROMISE_VALUE_OFFSET, nothing());
    Ok(result)
}

// ---------------------------------------------------------------------------
// Backtraces
// ---------------------------------------------------------------------------

pub fn new_heap_backtrace(heap: &mut Heap, roots: &Roots, entries: Value) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::vm::BACKTRACE_FIELD_COUNT),
        roots.species_for(Family::Backtrace),
    )?;
    set_heap_object_field(result, crate::vm::BACKTRACE_ENTRIES_OFFSET, entries);
    Ok(result)
}

pub fn new_heap_backtrace_entry(
    heap: &mut Heap,
    roots: &Roots,
    invocation: Value,
    opcode: Value,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::vm::BACKTRACE_ENTRY_FIELD_COUNT),
        roots.species_for(Family::BacktraceEntry),
    )?;
    set_heap_object_field(result, crate::vm::BACKTRACE_ENTRY_INVOCATION_OFFSET, invocation);
    set_heap_object_field(result, crate::vm::BACKTRACE_ENTRY_OPCODE_OFFSET, opcode);
    Ok(result)
}

// ---------------------------------------------------------------------------
// Modules and binding
// ---------------------------------------------------------------------------

pub fn new_heap_path(heap: &mut Heap, roots: &Roots, raw_head: Value, raw_tail: Value) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::bind::PATH_FIELD_COUNT),
        roots.modal_species(Family::Path, Mode::Mutable),
    )?;
    set_heap_object_field(result, crate::bind::PATH_RAW_HEAD_OFFSET, raw_head);
    set_heap_object_field(result, crate::bind::PATH_RAW_TAIL_OFFSET, raw_tail);
    Ok(result)
}

pub fn new_heap_identifier(heap: &mut Heap, roots: &Roots, stage: Value, path: Value) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::bind::IDENTIFIER_FIELD_COUNT),
        roots.modal_species(Family::Identifier, Mode::Mutable),
    )?;
    set_heap_object_field(result, crate::bind::IDENTIFIER_STAGE_OFFSET, stage);
    set_heap_object_field(result, crate::bind::IDENTIFIER_PATH_OFFSET, path);
    Ok(result)
}

pub fn new_heap_module(heap: &mut Heap, roots: &Roots, path: Value) -> Result<Value, Condition> {
    let fragments = new_heap_array_buffer(heap, roots, 4)?;
    let result = alloc_object(
        heap,
        heap_object_size(crate::bind::MODULE_FIELD_COUNT),
        roots.modal_species(Family::Module, Mode::Mutable),
    )?;
    set_heap_object_field(result, crate::bind::MODULE_PATH_OFFSET, path);
    set_heap_object_field(result, crate::bind::MODULE_FRAGMENTS_OFFSET, fragments);
    Ok(result)
}

pub fn new_heap_module_fragment(
    heap: &mut Heap,
    roots: &Roots,
    stage: Value,
    module: Value,
) -> Result<Value, Condition> {
    let namespace = new_heap_namespace(heap, roots)?;
    let methodspace = new_heap_methodspace(heap, roots)?;
    let imports = new_heap_array_buffer(heap, roots, 4)?;
    let result = alloc_object(
        heap,
        heap_object_size(crate::bind::MODULE_FRAGMENT_FIELD_COUNT),
        roots.modal_species(Family::ModuleFragment, Mode::Mutable),
    )?;
    set_heap_object_field(result, crate::bind::MODULE_FRAGMENT_STAGE_OFFSET, stage);
    set_heap_object_field(result, crate::bind::MODULE_FRAGMENT_MODULE_OFFSET, module);
    set_heap_object_field(result, crate::bind::MODULE_FRAGMENT_NAMESPACE_OFFSET, namespace);
    set_heap_object_field(result, crate::bind::MODULE_FRAGMENT_METHODSPACE_OFFSET, methodspace);
    set_heap_object_field(result, crate::bind::MODULE_FRAGMENT_IMPORTS_OFFSET, imports);
    crate::bind::set_module_fragment_epoch(result, crate::bind::FragmentEpoch::Uninitialized);
    set_heap_object_field(result, crate::bind::MODULE_FRAGMENT_PRIVATE_OFFSET, nothing());
    let private = new_heap_module_fragment_private(heap, roots, result)?;
    set_heap_object_field(result, crate::bind::MODULE_FRAGMENT_PRIVATE_OFFSET, private);
    Ok(result)
}

pub fn new_heap_module_fragment_private(
    heap: &mut Heap,
    roots: &Roots,
    owner: Value,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::bind::MODULE_FRAGMENT_PRIVATE_FIELD_COUNT),
        roots.modal_species(Family::ModuleFragmentPrivate, Mode::Mutable),
    )?;
    set_heap_object_field(result, crate::bind::MODULE_FRAGMENT_PRIVATE_OWNER_OFFSET, owner);
    Ok(result)
}

pub fn new_heap_unbound_module(
    heap: &mut Heap,
    roots: &Roots,
    path: Value,
    fragments: Value,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::bind::UNBOUND_MODULE_FIELD_COUNT),
        roots.species_for(Family::UnboundModule),
    )?;
    set_heap_object_field(result, crate::bind::UNBOUND_MODULE_PATH_OFFSET, path);
    set_heap_object_field(result, crate::bind::UNBOUND_MODULE_FRAGMENTS_OFFSET, fragments);
    Ok(result)
}

pub fn new_heap_unbound_module_fragment(
    heap: &mut Heap,
    roots: &Roots,
    stage: Value,
    imports: Value,
    elements: Value,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::bind::UNBOUND_MODULE_FRAGMENT_FIELD_COUNT),
        roots.species_for(Family::UnboundModuleFragment),
    )?;
    set_heap_object_field(result, crate::bind::UNBOUND_MODULE_FRAGMENT_STAGE_OFFSET, stage);
    set_heap_object_field(result, crate::bind::UNBOUND_MODULE_FRAGMENT_IMPORTS_OFFSET, imports);
    set_heap_object_field(result, crate::bind::UNBOUND_MODULE_FRAGMENT_ELEMENTS_OFFSET, elements);
    Ok(result)
}

pub fn new_heap_library(
    heap: &mut Heap,
    roots: &Roots,
    display_name: Value,
    modules: Value,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::bind::LIBRARY_FIELD_COUNT),
        roots.species_for(Family::Library),
    )?;
    set_heap_object_field(result, crate::bind::LIBRARY_DISPLAY_NAME_OFFSET, display_name);
    set_heap_object_field(result, crate::bind::LIBRARY_MODULES_OFFSET, modules);
    Ok(result)
}

pub fn new_heap_module_loader(heap: &mut Heap, roots: &Roots) -> Result<Value, Condition> {
    let modules = new_heap_id_hash_map(heap, roots, 16)?;
    let result = alloc_object(
        heap,
        heap_object_size(crate::bind::MODULE_LOADER_FIELD_COUNT),
        roots.species_for(Family::ModuleLoader),
    )?;
    set_heap_object_field(result, crate::bind::MODULE_LOADER_MODULES_OFFSET, modules);
    Ok(result)
}

pub fn new_heap_namespace(heap: &mut Heap, roots: &Roots) -> Result<Value, Condition> {
    let bindings = new_heap_id_hash_map(heap, roots, 16)?;
    let result = alloc_object(
        heap,
        heap_object_size(crate::bind::NAMESPACE_FIELD_COUNT),
        roots.modal_species(Family::Namespace, Mode::Mutable),
    )?;
    set_heap_object_field(result, crate::bind::NAMESPACE_BINDINGS_OFFSET, bindings);
    Ok(result)
}

// ---------------------------------------------------------------------------
// Processes and tasks
// ---------------------------------------------------------------------------

pub fn new_heap_task(heap: &mut Heap, roots: &Roots, process: Value, stack: Value) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::process::TASK_FIELD_COUNT),
        roots.species_for(Family::Task),
    )?;
    set_heap_object_field(result, crate::process::TASK_PROCESS_OFFSET, process);
    set_heap_object_field(result, crate::process::TASK_STACK_OFFSET, stack);
    Ok(result)
}

pub fn new_heap_process_raw(
    heap: &mut Heap,
    roots: &Roots,
    work_queue: Value,
    hash_source: Value,
    airlock_ptr: Value,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        heap_object_size(crate::process::PROCESS_FIELD_COUNT),
        roots.species_for(Family::Process),
    )?;
    set_heap_object_field(result, crate::process::PROCESS_WORK_QUEUE_OFFSET, work_queue);
    set_heap_object_field(result, crate::process::PROCESS_ROOT_TASK_OFFSET, nothing());
    set_heap_object_field(result, crate::process::PROCESS_HASH_SOURCE_OFFSET, hash_source);
    set_heap_object_field(result, crate::process::PROCESS_AIRLOCK_PTR_OFFSET, airlock_ptr);
    Ok(result)
}

// ---------------------------------------------------------------------------
// Species
// ---------------------------------------------------------------------------

fn init_species_header(result: Value, family: Family, division: species::Division) {
    set_heap_object_field(
        result,
        species::SPECIES_FAMILY_OFFSET,
        Value::new_integer(family.ordinal() as i64),
    );
    set_heap_object_field(
        result,
        species::SPECIES_BEHAVIOR_OFFSET,
        Value::new_integer(family.ordinal() as i64),
    );
    set_heap_object_field(
        result,
        species::SPECIES_DIVISION_OFFSET,
        Value::new_integer(division as i64),
    );
}

pub fn new_heap_compact_species(
    heap: &mut Heap,
    species_species: Value,
    family: Family,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        species::species_size(species::Division::Compact),
        species_species,
    )?;
    init_species_header(result, family, species::Division::Compact);
    Ok(result)
}

pub fn new_heap_modal_species(
    heap: &mut Heap,
    species_species: Value,
    family: Family,
    mode: Mode,
    base_root: usize,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        species::species_size(species::Division::Modal),
        species_species,
    )?;
    init_species_header(result, family, species::Division::Modal);
    species::set_modal_species_mode(result, mode);
    species::set_modal_species_base_root(result, base_root);
    Ok(result)
}

pub fn new_heap_c_object_species(
    heap: &mut Heap,
    species_species: Value,
    info: species::CObjectInfo,
    type_value: Value,
) -> Result<Value, Condition> {
    let result = alloc_object(
        heap,
        species::species_size(species::Division::CObject),
        species_species,
    )?;
    init_species_header(result, Family::CObject, species::Division::CObject);
    set_heap_object_field(
        result,
        species::C_OBJECT_SPECIES_DATA_SIZE_OFFSET,
        Value::new_integer(info.data_size as i64),
    );
    set_heap_object_field(
        result,
        species::C_OBJECT_SPECIES_VALUE_COUNT_OFFSET,
        Value::new_integer(info.value_count as i64),
    );
    set_heap_object_field(result, species::C_OBJECT_SPECIES_TYPE_OFFSET, type_value);
    Ok(result)
}
