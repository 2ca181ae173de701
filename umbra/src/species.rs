/// Species — Per-Family Meta-Objects and Behavior Tables
///
/// Every heap object's header points to its _species_, itself a heap object.
/// The species records which family the object belongs to and points at the
/// family's behavior table, the vtable that lets core infrastructure work on
/// objects without knowing their family: layout for the gc, validation,
/// printing, identity hashing and comparison, freezing.
///
/// Species come in _divisions_ that determine the species object's own shape:
///
///   Compact   — no extra state, one species per family
///   Modal     — carries the mode of its instances plus the root key of the
///               fluid sibling, so changing mode is swapping the header to a
///               sibling species
///   Instance  — carries primary type, manager, raw mode and a derivatives
///               array of mode siblings allocated on demand
///   CObject   — carries the data/value layout of a native-backed family
///
/// The behavior and division tables are static; species store table indexes
/// as tagged integers so the gc can scan species like any other object.

use crate::core::tagged::{self, is_nothing, Relation};
use crate::core::value::{
    Condition, ConditionCause, Domain, Value, VALUE_SIZE,
};
use crate::heap::{
    get_heap_object_field, heap_object_field_offset, heap_object_size,
    set_heap_object_field, set_heap_object_header, HeapObjectLayout,
};
use crate::runtime::Runtime;

// ---------------------------------------------------------------------------
// Families
// ---------------------------------------------------------------------------

/// The concrete kind of a heap object.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Species = 0,
    Utf8,
    Blob,
    Array,
    ArrayBuffer,
    IdHashMap,
    FifoBuffer,
    Type,
    Instance,
    InstanceManager,
    HardField,
    SoftField,
    HashSource,
    HashOracle,
    Promise,
    Key,
    Operation,
    Reference,
    VoidP,
    CObject,
    CodeBlock,
    Stack,
    StackPiece,
    Escape,
    Lambda,
    Block,
    Signature,
    Parameter,
    Guard,
    CallTags,
    CallData,
    Method,
    SignatureMap,
    Methodspace,
    Ambience,
    Path,
    Identifier,
    Module,
    ModuleFragment,
    ModuleFragmentPrivate,
    UnboundModule,
    UnboundModuleFragment,
    Library,
    ModuleLoader,
    Namespace,
    Backtrace,
    BacktraceEntry,
    ArgumentMapTrie,
    Process,
    Task,
}

pub const FAMILY_COUNT: usize = Family::Task as usize + 1;

impl Family {
    pub fn ordinal(self) -> usize {
        self as usize
    }

    pub fn from_ordinal(ordinal: usize) -> Family {
        debug_assert!(ordinal < FAMILY_COUNT);
        // The enum is repr(u16) with contiguous discriminants starting at 0.
        unsafe { std::mem::transmute(ordinal as u16) }
    }

    pub fn name(self) -> &'static str {
        match self {
            Family::Species               => "Species",
            Family::Utf8                  => "Utf8",
            Family::Blob                  => "Blob",
            Family::Array                 => "Array",
            Family::ArrayBuffer           => "ArrayBuffer",
            Family::IdHashMap             => "IdHashMap",
            Family::FifoBuffer            => "FifoBuffer",
            Family::Type                  => "Type",
            Family::Instance              => "Instance",
            Family::InstanceManager       => "InstanceManager",
            Family::HardField             => "HardField",
            Family::SoftField             => "SoftField",
            Family::HashSource            => "HashSource",
            Family::HashOracle            => "HashOracle",
            Family::Promise               => "Promise",
            Family::Key                   => "Key",
            Family::Operation             => "Operation",
            Family::Reference             => "Reference",
            Family::VoidP                 => "VoidP",
            Family::CObject               => "CObject",
            Family::CodeBlock             => "CodeBlock",
            Family::Stack                 => "Stack",
            Family::StackPiece            => "StackPiece",
            Family::Escape                => "Escape",
            Family::Lambda                => "Lambda",
            Family::Block                 => "Block",
            Family::Signature             => "Signature",
            Family::Parameter             => "Parameter",
            Family::Guard                 => "Guard",
            Family::CallTags              => "CallTags",
            Family::CallData              => "CallData",
            Family::Method                => "Method",
            Family::SignatureMap          => "SignatureMap",
            Family::Methodspace           => "Methodspace",
            Family::Ambience              => "Ambience",
            Family::Path                  => "Path",
            Family::Identifier            => "Identifier",
            Family::Module                => "Module",
            Family::ModuleFragment        => "ModuleFragment",
            Family::ModuleFragmentPrivate => "ModuleFragmentPrivate",
            Family::UnboundModule         => "UnboundModule",
            Family::UnboundModuleFragment => "UnboundModuleFragment",
            Family::Library               => "Library",
            Family::ModuleLoader          => "ModuleLoader",
            Family::Namespace             => "Namespace",
            Family::Backtrace             => "Backtrace",
            Family::BacktraceEntry        => "BacktraceEntry",
            Family::ArgumentMapTrie       => "ArgumentMapTrie",
            Family::Process               => "Process",
            Family::Task                  => "Task",
        }
    }
}

// ---------------------------------------------------------------------------
// Divisions and modes
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Division {
    Compact  = 0,
    Modal    = 1,
    Instance = 2,
    CObject  = 3,
}

impl Division {
    pub fn name(self) -> &'static str {
        match self {
            Division::Compact  => "Compact",
            Division::Modal    => "Modal",
            Division::Instance => "Instance",
            Division::CObject  => "CObject",
        }
    }

    /// Number of division-specific species fields past the species header.
    pub const fn species_field_count(self) -> usize {
        match self {
            Division::Compact  => 0,
            Division::Modal    => 2,
            Division::Instance => 4,
            Division::CObject  => 3,
        }
    }
}

/// Mutability mode of a value. Transitions are monotone towards more
/// restricted.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mode {
    /// Any change may be made, including which type the object supports.
    Fluid = 0,
    /// Fields may be set.
    Mutable = 1,
    /// The object itself cannot change but may reference objects that can.
    Frozen = 2,
    /// Neither the object nor anything reachable from it can change.
    DeepFrozen = 3,
}

impl Mode {
    pub fn from_raw(raw: i64) -> Mode {
        match raw {
            0 => Mode::Fluid,
            1 => Mode::Mutable,
            2 => Mode::Frozen,
            _ => Mode::DeepFrozen,
        }
    }
}

// ---------------------------------------------------------------------------
// Species object layout
// ---------------------------------------------------------------------------

pub const SPECIES_FAMILY_OFFSET: usize = heap_object_field_offset(0);
pub const SPECIES_BEHAVIOR_OFFSET: usize = heap_object_field_offset(1);
pub const SPECIES_DIVISION_OFFSET: usize = heap_object_field_offset(2);
pub const SPECIES_HEADER_FIELD_COUNT: usize = 3;

/// Byte offset of the n'th division-specific species field.
pub const fn species_field_offset(n: usize) -> usize {
    heap_object_field_offset(SPECIES_HEADER_FIELD_COUNT + n)
}

pub const MODAL_SPECIES_MODE_OFFSET: usize = species_field_offset(0);
pub const MODAL_SPECIES_BASE_ROOT_OFFSET: usize = species_field_offset(1);

pub const INSTANCE_SPECIES_PRIMARY_TYPE_OFFSET: usize = species_field_offset(0);
pub const INSTANCE_SPECIES_MANAGER_OFFSET: usize = species_field_offset(1);
pub const INSTANCE_SPECIES_RAW_MODE_OFFSET: usize = species_field_offset(2);
pub const INSTANCE_SPECIES_DERIVATIVES_OFFSET: usize = species_field_offset(3);

pub const C_OBJECT_SPECIES_DATA_SIZE_OFFSET: usize = species_field_offset(0);
pub const C_OBJECT_SPECIES_VALUE_COUNT_OFFSET: usize = species_field_offset(1);
pub const C_OBJECT_SPECIES_TYPE_OFFSET: usize = species_field_offset(2);

pub const fn species_size(division: Division) -> usize {
    heap_object_size(SPECIES_HEADER_FIELD_COUNT + division.species_field_count())
}

/// The species of an object: its header during normal execution.
#[inline]
pub fn get_heap_object_species(obj: Value) -> Value {
    crate::heap::get_heap_object_header(obj)
}

#[inline]
pub fn set_heap_object_species(obj: Value, species: Value) {
    set_heap_object_header(obj, species);
}

#[inline]
pub fn get_species_instance_family(species: Value) -> Family {
    Family::from_ordinal(get_heap_object_field(species, SPECIES_FAMILY_OFFSET).as_integer() as usize)
}

#[inline]
pub fn get_species_division(species: Value) -> Division {
    match get_heap_object_field(species, SPECIES_DIVISION_OFFSET).as_integer() {
        0 => Division::Compact,
        1 => Division::Modal,
        2 => Division::Instance,
        _ => Division::CObject,
    }
}

#[inline]
pub fn get_species_family_behavior(species: Value) -> &'static FamilyBehavior {
    let index = get_heap_object_field(species, SPECIES_BEHAVIOR_OFFSET).as_integer() as usize;
    &FAMILY_BEHAVIORS[index]
}

/// The family of the object the given value points to.
#[inline]
pub fn get_heap_object_family(obj: Value) -> Family {
    get_species_instance_family(get_heap_object_species(obj))
}

/// Family behavior for an object whose species may already have been migrated;
/// chases the forward pointer if there is one. Only needed during gc.
#[inline]
pub fn get_heap_object_family_behavior_unchecked(obj: Value) -> &'static FamilyBehavior {
    let header = crate::heap::get_heap_object_header(obj).chase_moved_object();
    get_species_family_behavior(header)
}

#[inline]
pub fn in_family(family: Family, value: Value) -> bool {
    value.is_heap_object() && get_heap_object_family(value) == family
}

/// True if the value is the nothing sentinel or in the given family; used for
/// optional fields.
#[inline]
pub fn in_family_opt(family: Family, value: Value) -> bool {
    is_nothing(value) || in_family(family, value)
}

// ── Modal species fields ─────────────────────────────────────────────────────

pub fn get_modal_species_mode(species: Value) -> Mode {
    Mode::from_raw(get_heap_object_field(species, MODAL_SPECIES_MODE_OFFSET).as_integer())
}

pub fn set_modal_species_mode(species: Value, mode: Mode) {
    set_heap_object_field(species, MODAL_SPECIES_MODE_OFFSET, Value::new_integer(mode as i64));
}

/// Root key of the fluid sibling of this block of modal species; adding the
/// mode to this key indexes the sibling with that mode.
pub fn get_modal_species_base_root(species: Value) -> usize {
    get_heap_object_field(species, MODAL_SPECIES_BASE_ROOT_OFFSET).as_integer() as usize
}

pub fn set_modal_species_base_root(species: Value, base_root: usize) {
    set_heap_object_field(
        species,
        MODAL_SPECIES_BASE_ROOT_OFFSET,
        Value::new_integer(base_root as i64),
    );
}

// ── Instance species fields ──────────────────────────────────────────────────

pub fn get_instance_species_primary_type(species: Value) -> Value {
    get_heap_object_field(species, INSTANCE_SPECIES_PRIMARY_TYPE_OFFSET)
}

pub fn set_instance_species_primary_type(species: Value, value: Value) {
    set_heap_object_field(species, INSTANCE_SPECIES_PRIMARY_TYPE_OFFSET, value);
}

pub fn get_instance_species_manager(species: Value) -> Value {
    get_heap_object_field(species, INSTANCE_SPECIES_MANAGER_OFFSET)
}

pub fn set_instance_species_manager(species: Value, value: Value) {
    set_heap_object_field(species, INSTANCE_SPECIES_MANAGER_OFFSET, value);
}

pub fn get_instance_species_raw_mode(species: Value) -> Mode {
    Mode::from_raw(get_heap_object_field(species, INSTANCE_SPECIES_RAW_MODE_OFFSET).as_integer())
}

pub fn set_instance_species_raw_mode(species: Value, mode: Mode) {
    set_heap_object_field(
        species,
        INSTANCE_SPECIES_RAW_MODE_OFFSET,
        Value::new_integer(mode as i64),
    );
}

/// Array buffer of sibling species, identical but with different modes.
pub fn get_instance_species_derivatives(species: Value) -> Value {
    get_heap_object_field(species, INSTANCE_SPECIES_DERIVATIVES_OFFSET)
}

pub fn set_instance_species_derivatives(species: Value, value: Value) {
    set_heap_object_field(species, INSTANCE_SPECIES_DERIVATIVES_OFFSET, value);
}

// ── CObject species fields ───────────────────────────────────────────────────

/// Describes the shape of a native-backed object family: raw data bytes
/// followed by garbage-collected value fields. Plugins register these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CObjectInfo {
    pub data_size: usize,
    pub value_count: usize,
}

pub fn get_c_object_species_data_size(species: Value) -> usize {
    get_heap_object_field(species, C_OBJECT_SPECIES_DATA_SIZE_OFFSET).as_integer() as usize
}

pub fn get_c_object_species_value_count(species: Value) -> usize {
    get_heap_object_field(species, C_OBJECT_SPECIES_VALUE_COUNT_OFFSET).as_integer() as usize
}

pub fn get_c_object_species_type(species: Value) -> Value {
    get_heap_object_field(species, C_OBJECT_SPECIES_TYPE_OFFSET)
}

// ---------------------------------------------------------------------------
// Hashing and cycle detection
// ---------------------------------------------------------------------------

/// Accumulates a hash over the parts of a value. FNV-1a; quality matters less
/// than the guarantee that equal structures hash equal.
pub struct HashStream(u64);

impl HashStream {
    pub fn new() -> HashStream {
        HashStream(0xcbf29ce484222325)
    }

    #[inline]
    pub fn write_u64(&mut self, word: u64) {
        for byte in word.to_le_bytes() {
            self.0 ^= byte as u64;
            self.0 = self.0.wrapping_mul(0x100000001b3);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 ^= byte as u64;
            self.0 = self.0.wrapping_mul(0x100000001b3);
        }
    }

    pub fn finish(&self) -> u64 {
        self.0
    }
}

impl Default for HashStream {
    fn default() -> Self {
        HashStream::new()
    }
}

/// Guards recursive traversals against reference cycles. Enter an object
/// before descending into it; a re-entry yields a Circular condition.
pub struct CycleDetector {
    entered: Vec<u64>,
}

pub const CIRCULAR_DEPTH_LIMIT: usize = 1024;

impl CycleDetector {
    pub fn new() -> CycleDetector {
        CycleDetector { entered: Vec::new() }
    }

    pub fn enter(&mut self, value: Value) -> Result<(), Condition> {
        if self.entered.len() >= CIRCULAR_DEPTH_LIMIT
            || self.entered.contains(&value.raw())
        {
            return Err(Condition::new(ConditionCause::Circular));
        }
        self.entered.push(value.raw());
        Ok(())
    }

    pub fn exit(&mut self) {
        self.entered.pop();
    }
}

impl Default for CycleDetector {
    fn default() -> Self {
        CycleDetector::new()
    }
}

/// Context threaded through print_on implementations. The depth limit keeps
/// cyclic structures printable.
pub struct PrintContext {
    pub buf: String,
    pub depth: usize,
}

pub const PRINT_DEPTH_LIMIT: usize = 8;

impl PrintContext {
    pub fn new() -> PrintContext {
        PrintContext { buf: String::new(), depth: 0 }
    }
}

impl Default for PrintContext {
    fn default() -> Self {
        PrintContext::new()
    }
}

// ---------------------------------------------------------------------------
// Family behavior
// ---------------------------------------------------------------------------

/// The vtable of a family. One static instance per family; species store the
/// table index.
pub struct FamilyBehavior {
    pub family: Family,
    /// Which division this family's species belong to.
    pub division: Division,
    /// Mode of all instances, for families that don't store mode per species.
    pub fixed_mode: Option<Mode>,
    /// Object layout. None means a plain fixed-size all-value object with
    /// `field_count` fields.
    pub layout: Option<fn(Value) -> HeapObjectLayout>,
    pub field_count: usize,
    /// Family-specific validation past the generic header checks.
    pub validate: Option<fn(Value) -> Result<(), Condition>>,
    pub print_on: Option<fn(Value, &mut PrintContext)>,
    /// Content-based identity hash; None hashes the (transient) address.
    pub transient_identity_hash:
        Option<fn(Value, &mut HashStream, &mut CycleDetector) -> Result<(), Condition>>,
    /// Structural identity; None means bitwise only.
    pub identity_compare:
        Option<fn(Value, Value, &mut CycleDetector) -> Result<bool, Condition>>,
    /// Ordered comparison within the family; None means unordered.
    pub ordering_compare: Option<fn(Value, Value) -> Value>,
    /// Freezes the objects this object owns as part of its own freeze.
    pub ensure_owned_values_frozen:
        Option<fn(&mut Runtime, Value) -> Result<(), Condition>>,
    /// Invoked on the migrated copy during gc, after its fields have been
    /// migrated; used by hash maps whose layout depends on identity hashes.
    pub post_migrate_fixup: Option<fn(Value)>,
}

const fn behavior(family: Family, division: Division, field_count: usize) -> FamilyBehavior {
    FamilyBehavior {
        family,
        division,
        fixed_mode: Some(Mode::Mutable),
        layout: None,
        field_count,
        validate: None,
        print_on: None,
        transient_identity_hash: None,
        identity_compare: None,
        ordering_compare: None,
        ensure_owned_values_frozen: None,
        post_migrate_fixup: None,
    }
}

const fn modal(family: Family, field_count: usize) -> FamilyBehavior {
    let mut b = behavior(family, Division::Modal, field_count);
    b.fixed_mode = None;
    b
}

pub static FAMILY_BEHAVIORS: [FamilyBehavior; FAMILY_COUNT] = [
    // Species
    FamilyBehavior {
        layout: Some(species_layout),
        validate: Some(species_validate),
        ..behavior(Family::Species, Division::Compact, SPECIES_HEADER_FIELD_COUNT)
    },
    // Utf8
    FamilyBehavior {
        fixed_mode: Some(Mode::DeepFrozen),
        layout: Some(crate::objects::utf8_layout),
        validate: Some(crate::objects::utf8_validate),
        print_on: Some(crate::objects::utf8_print_on),
        transient_identity_hash: Some(crate::objects::utf8_transient_identity_hash),
        identity_compare: Some(crate::objects::utf8_identity_compare),
        ordering_compare: Some(crate::objects::utf8_ordering_compare),
        ..behavior(Family::Utf8, Division::Compact, 0)
    },
    // Blob
    FamilyBehavior {
        layout: Some(crate::objects::blob_layout),
        validate: Some(crate::objects::blob_validate),
        print_on: Some(crate::objects::blob_print_on),
        ..behavior(Family::Blob, Division::Compact, 0)
    },
    // Array
    FamilyBehavior {
        layout: Some(crate::objects::array_layout),
        validate: Some(crate::objects::array_validate),
        print_on: Some(crate::objects::array_print_on),
        transient_identity_hash: Some(crate::objects::array_transient_identity_hash),
        identity_compare: Some(crate::objects::array_identity_compare),
        ensure_owned_values_frozen: None,
        ..modal(Family::Array, 0)
    },
    // ArrayBuffer
    FamilyBehavior {
        validate: Some(crate::objects::array_buffer_validate),
        ensure_owned_values_frozen: Some(crate::objects::ensure_array_buffer_owned_values_frozen),
        ..modal(Family::ArrayBuffer, crate::objects::ARRAY_BUFFER_FIELD_COUNT)
    },
    // IdHashMap
    FamilyBehavior {
        validate: Some(crate::maps::id_hash_map_validate),
        print_on: Some(crate::maps::id_hash_map_print_on),
        ensure_owned_values_frozen: Some(crate::maps::ensure_id_hash_map_owned_values_frozen),
        post_migrate_fixup: Some(crate::maps::fixup_id_hash_map_post_migrate),
        ..modal(Family::IdHashMap, crate::maps::ID_HASH_MAP_FIELD_COUNT)
    },
    // FifoBuffer
    FamilyBehavior {
        validate: Some(crate::maps::fifo_buffer_validate),
        ..behavior(Family::FifoBuffer, Division::Compact, crate::maps::FIFO_BUFFER_FIELD_COUNT)
    },
    // Type
    FamilyBehavior {
        print_on: Some(crate::instance::type_print_on),
        ..modal(Family::Type, crate::instance::TYPE_FIELD_COUNT)
    },
    // Instance
    FamilyBehavior {
        validate: Some(crate::instance::instance_validate),
        print_on: Some(crate::instance::instance_print_on),
        ensure_owned_values_frozen: Some(crate::instance::ensure_instance_owned_values_frozen),
        ..behavior(Family::Instance, Division::Instance, crate::instance::INSTANCE_FIELD_COUNT)
    },
    // InstanceManager
    FamilyBehavior {
        fixed_mode: Some(Mode::DeepFrozen),
        ..behavior(Family::InstanceManager, Division::Compact, crate::instance::INSTANCE_MANAGER_FIELD_COUNT)
    },
    // HardField
    FamilyBehavior {
        fixed_mode: Some(Mode::Frozen),
        print_on: Some(crate::instance::hard_field_print_on),
        ..behavior(Family::HardField, Division::Compact, crate::instance::HARD_FIELD_FIELD_COUNT)
    },
    // SoftField
    FamilyBehavior {
        fixed_mode: Some(Mode::Frozen),
        ..behavior(Family::SoftField, Division::Compact, crate::instance::SOFT_FIELD_FIELD_COUNT)
    },
    // HashSource
    FamilyBehavior {
        layout: Some(crate::instance::hash_source_layout),
        ..behavior(Family::HashSource, Division::Compact, 0)
    },
    // HashOracle
    FamilyBehavior {
        ensure_owned_values_frozen: Some(crate::instance::ensure_hash_oracle_owned_values_frozen),
        ..modal(Family::HashOracle, crate::instance::HASH_ORACLE_FIELD_COUNT)
    },
    // Promise
    FamilyBehavior {
        print_on: Some(crate::instance::promise_print_on),
        ..behavior(Family::Promise, Division::Compact, crate::instance::PROMISE_FIELD_COUNT)
    },
    // Key
    FamilyBehavior {
        print_on: Some(crate::objects::key_print_on),
        transient_identity_hash: Some(crate::objects::key_transient_identity_hash),
        ordering_compare: Some(crate::objects::key_ordering_compare),
        ..modal(Family::Key, crate::objects::KEY_FIELD_COUNT)
    },
    // Operation
    FamilyBehavior {
        print_on: Some(crate::objects::operation_print_on),
        transient_identity_hash: Some(crate::objects::operation_transient_identity_hash),
        identity_compare: Some(crate::objects::operation_identity_compare),
        ..modal(Family::Operation, crate::objects::OPERATION_FIELD_COUNT)
    },
    // Reference
    behavior(Family::Reference, Division::Compact, crate::objects::REFERENCE_FIELD_COUNT),
    // VoidP
    FamilyBehavior {
        layout: Some(crate::objects::void_p_layout),
        ..behavior(Family::VoidP, Division::Compact, 0)
    },
    // CObject
    FamilyBehavior {
        layout: Some(crate::objects::c_object_layout),
        ..behavior(Family::CObject, Division::CObject, 0)
    },
    // CodeBlock
    FamilyBehavior {
        validate: Some(crate::bytecode::code_block_validate),
        print_on: Some(crate::bytecode::code_block_print_on),
        ensure_owned_values_frozen: Some(crate::bytecode::ensure_code_block_owned_values_frozen),
        ..modal(Family::CodeBlock, crate::bytecode::CODE_BLOCK_FIELD_COUNT)
    },
    // Stack
    FamilyBehavior {
        validate: Some(crate::stack::stack_validate),
        ..behavior(Family::Stack, Division::Compact, crate::stack::STACK_FIELD_COUNT)
    },
    // StackPiece
    FamilyBehavior {
        layout: Some(crate::stack::stack_piece_layout),
        validate: Some(crate::stack::stack_piece_validate),
        print_on: Some(crate::stack::stack_piece_print_on),
        ..behavior(Family::StackPiece, Division::Compact, 0)
    },
    // Escape
    FamilyBehavior {
        validate: Some(crate::closures::escape_validate),
        ..behavior(Family::Escape, Division::Compact, crate::closures::ESCAPE_FIELD_COUNT)
    },
    // Lambda
    FamilyBehavior {
        print_on: Some(crate::closures::lambda_print_on),
        ensure_owned_values_frozen: Some(crate::closures::ensure_lambda_owned_values_frozen),
        ..modal(Family::Lambda, crate::closures::LAMBDA_FIELD_COUNT)
    },
    // Block
    FamilyBehavior {
        validate: Some(crate::closures::block_validate),
        print_on: Some(crate::closures::block_print_on),
        ..modal(Family::Block, crate::closures::BLOCK_FIELD_COUNT)
    },
    // Signature
    FamilyBehavior {
        validate: Some(crate::method::signature_validate),
        ensure_owned_values_frozen: Some(crate::method::ensure_signature_owned_values_frozen),
        ..modal(Family::Signature, crate::method::SIGNATURE_FIELD_COUNT)
    },
    // Parameter
    modal(Family::Parameter, crate::method::PARAMETER_FIELD_COUNT),
    // Guard
    FamilyBehavior {
        print_on: Some(crate::method::guard_print_on),
        ..modal(Family::Guard, crate::method::GUARD_FIELD_COUNT)
    },
    // CallTags
    FamilyBehavior {
        validate: Some(crate::method::call_tags_validate),
        print_on: Some(crate::method::call_tags_print_on),
        identity_compare: Some(crate::method::call_tags_identity_compare),
        transient_identity_hash: Some(crate::method::call_tags_transient_identity_hash),
        ensure_owned_values_frozen: Some(crate::method::ensure_call_tags_owned_values_frozen),
        ..modal(Family::CallTags, crate::method::CALL_TAGS_FIELD_COUNT)
    },
    // CallData
    modal(Family::CallData, crate::method::CALL_DATA_FIELD_COUNT),
    // Method
    modal(Family::Method, crate::method::METHOD_FIELD_COUNT),
    // SignatureMap
    FamilyBehavior {
        ensure_owned_values_frozen: Some(crate::method::ensure_signature_map_owned_values_frozen),
        ..modal(Family::SignatureMap, crate::method::SIGNATURE_MAP_FIELD_COUNT)
    },
    // Methodspace
    FamilyBehavior {
        validate: Some(crate::method::methodspace_validate),
        ensure_owned_values_frozen: Some(crate::method::ensure_methodspace_owned_values_frozen),
        ..modal(Family::Methodspace, crate::method::METHODSPACE_FIELD_COUNT)
    },
    // Ambience
    behavior(Family::Ambience, Division::Compact, crate::method::AMBIENCE_FIELD_COUNT),
    // Path
    FamilyBehavior {
        validate: Some(crate::bind::path_validate),
        print_on: Some(crate::bind::path_print_on),
        transient_identity_hash: Some(crate::bind::path_transient_identity_hash),
        identity_compare: Some(crate::bind::path_identity_compare),
        ordering_compare: Some(crate::bind::path_ordering_compare),
        ..modal(Family::Path, crate::bind::PATH_FIELD_COUNT)
    },
    // Identifier
    FamilyBehavior {
        print_on: Some(crate::bind::identifier_print_on),
        transient_identity_hash: Some(crate::bind::identifier_transient_identity_hash),
        identity_compare: Some(crate::bind::identifier_identity_compare),
        ordering_compare: Some(crate::bind::identifier_ordering_compare),
        ..modal(Family::Identifier, crate::bind::IDENTIFIER_FIELD_COUNT)
    },
    // Module
    modal(Family::Module, crate::bind::MODULE_FIELD_COUNT),
    // ModuleFragment
    FamilyBehavior {
        validate: Some(crate::bind::module_fragment_validate),
        ..modal(Family::ModuleFragment, crate::bind::MODULE_FRAGMENT_FIELD_COUNT)
    },
    // ModuleFragmentPrivate
    modal(Family::ModuleFragmentPrivate, crate::bind::MODULE_FRAGMENT_PRIVATE_FIELD_COUNT),
    // UnboundModule
    behavior(Family::UnboundModule, Division::Compact, crate::bind::UNBOUND_MODULE_FIELD_COUNT),
    // UnboundModuleFragment
    behavior(
        Family::UnboundModuleFragment,
        Division::Compact,
        crate::bind::UNBOUND_MODULE_FRAGMENT_FIELD_COUNT,
    ),
    // Library
    behavior(Family::Library, Division::Compact, crate::bind::LIBRARY_FIELD_COUNT),
    // ModuleLoader
    behavior(Family::ModuleLoader, Division::Compact, crate::bind::MODULE_LOADER_FIELD_COUNT),
    // Namespace
    FamilyBehavior {
        ensure_owned_values_frozen: Some(crate::bind::ensure_namespace_owned_values_frozen),
        ..modal(Family::Namespace, crate::bind::NAMESPACE_FIELD_COUNT)
    },
    // Backtrace
    behavior(Family::Backtrace, Division::Compact, crate::vm::BACKTRACE_FIELD_COUNT),
    // BacktraceEntry
    behavior(Family::BacktraceEntry, Division::Compact, crate::vm::BACKTRACE_ENTRY_FIELD_COUNT),
    // ArgumentMapTrie
    modal(Family::ArgumentMapTrie, crate::method::ARGUMENT_MAP_TRIE_FIELD_COUNT),
    // Process
    behavior(Family::Process, Division::Compact, crate::process::PROCESS_FIELD_COUNT),
    // Task
    behavior(Family::Task, Division::Compact, crate::process::TASK_FIELD_COUNT),
];

pub fn family_behavior(family: Family) -> &'static FamilyBehavior {
    &FAMILY_BEHAVIORS[family.ordinal()]
}

fn species_layout(species: Value) -> HeapObjectLayout {
    let division = get_species_division(species);
    HeapObjectLayout::new(species_size(division), crate::heap::HEAP_OBJECT_HEADER_SIZE)
}

fn species_validate(species: Value) -> Result<(), Condition> {
    let family = get_heap_object_field(species, SPECIES_FAMILY_OFFSET);
    if !family.is_integer() || family.as_integer() as usize >= FAMILY_COUNT {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Generic dispatched operations
// ---------------------------------------------------------------------------

/// Layout of the given heap object, dispatched through the species.
pub fn get_heap_object_layout(obj: Value) -> HeapObjectLayout {
    let behavior = get_heap_object_family_behavior_unchecked(obj);
    match behavior.layout {
        Some(layout) => layout(obj),
        None => HeapObjectLayout::new(
            heap_object_size(behavior.field_count),
            crate::heap::HEAP_OBJECT_HEADER_SIZE,
        ),
    }
}

/// Validates a single value shallowly. Heap objects get their family hook.
pub fn value_validate(value: Value) -> Result<(), Condition> {
    match value.domain() {
        Domain::HeapObject => {
            let species = get_heap_object_species(value);
            if !species.is_heap_object() {
                return Err(Condition::validation_failed());
            }
            match get_species_family_behavior(species).validate {
                Some(validate) => validate(value),
                None => Ok(()),
            }
        }
        Domain::Condition | Domain::MovedObject => Err(Condition::validation_failed()),
        _ => Ok(()),
    }
}

/// Writes a human-readable rendering of the value.
pub fn value_print_on(value: Value, context: &mut PrintContext) {
    use std::fmt::Write;
    if context.depth > PRINT_DEPTH_LIMIT {
        context.buf.push('-');
        return;
    }
    match value.domain() {
        Domain::Integer => {
            let _ = write!(context.buf, "{}", value.as_integer());
        }
        Domain::HeapObject => {
            let behavior = get_species_family_behavior(get_heap_object_species(value));
            match behavior.print_on {
                Some(print_on) => print_on(value, context),
                None => {
                    let _ = write!(context.buf, "#<{} ~{:x}>", behavior.family.name(), value.raw());
                }
            }
        }
        Domain::CustomTagged => print_custom_tagged_on(value, context),
        Domain::DerivedObject => {
            let _ = write!(context.buf, "#<derived ~{:x}>", value.raw());
        }
        Domain::Condition | Domain::MovedObject => {
            let _ = write!(context.buf, "#<internal ~{:x}>", value.raw());
        }
    }
}

fn print_custom_tagged_on(value: Value, context: &mut PrintContext) {
    use std::fmt::Write;
    use crate::core::tagged::Phylum;
    match tagged::get_phylum(value) {
        Phylum::Null => context.buf.push_str("null"),
        Phylum::Nothing => context.buf.push_str("#<nothing>"),
        Phylum::Boolean => {
            context.buf.push_str(if tagged::get_boolean_value(value) { "true" } else { "false" })
        }
        Phylum::AsciiCharacter => {
            let _ = write!(context.buf, "{:?}", tagged::get_ascii_character_value(value) as char);
        }
        Phylum::Float32 => {
            let _ = write!(context.buf, "{}", tagged::get_float_32_value(value));
        }
        Phylum::StageOffset => {
            let _ = write!(context.buf, "@{}", tagged::get_stage_offset_value(value));
        }
        phylum => {
            let _ = write!(context.buf, "#<{} ~{:x}>", phylum.name(), value.raw());
        }
    }
}

/// Renders a value to a fresh string.
pub fn value_to_string(value: Value) -> String {
    let mut context = PrintContext::new();
    value_print_on(value, &mut context);
    context.buf
}

/// Identity hash of the value. Transient: for most heap objects the hash is
/// derived from the address, which changes when the collector moves the
/// object. Content-hashed families (strings, arrays, paths, …) are stable.
pub fn value_transient_identity_hash(value: Value) -> Result<u64, Condition> {
    let mut stream = HashStream::new();
    let mut detector = CycleDetector::new();
    value_transient_identity_hash_cycle_protect(value, &mut stream, &mut detector)?;
    Ok(stream.finish())
}

pub fn value_transient_identity_hash_cycle_protect(
    value: Value,
    stream: &mut HashStream,
    detector: &mut CycleDetector,
) -> Result<(), Condition> {
    match value.domain() {
        Domain::HeapObject => {
            let behavior = get_species_family_behavior(get_heap_object_species(value));
            stream.write_u64(behavior.family.ordinal() as u64);
            match behavior.transient_identity_hash {
                Some(hash) => hash(value, stream, detector),
                None => {
                    stream.write_u64(value.raw());
                    Ok(())
                }
            }
        }
        _ => {
            stream.write_u64(value.raw());
            Ok(())
        }
    }
}

/// Identity comparison: bitwise sameness or, for families with structural
/// identity (strings, arrays, paths, …), content equality.
pub fn value_identity_compare(a: Value, b: Value) -> bool {
    let mut detector = CycleDetector::new();
    value_identity_compare_cycle_protect(a, b, &mut detector).unwrap_or(false)
}

pub fn value_identity_compare_cycle_protect(
    a: Value,
    b: Value,
    detector: &mut CycleDetector,
) -> Result<bool, Condition> {
    if a == b {
        return Ok(true);
    }
    if a.domain() != Domain::HeapObject || b.domain() != Domain::HeapObject {
        return Ok(false);
    }
    let a_family = get_heap_object_family(a);
    let b_family = get_heap_object_family(b);
    if a_family != b_family {
        return Ok(false);
    }
    match family_behavior(a_family).identity_compare {
        Some(compare) => compare(a, b, detector),
        None => Ok(false),
    }
}

/// Ordered comparison used for sorting tags and user-visible ordering. Values
/// from different domains (or families) order by their ordinals; unorderable
/// values compare as Unordered.
pub fn value_ordering_compare(a: Value, b: Value) -> Value {
    let a_ordinal = domain_or_family_ordinal(a);
    let b_ordinal = domain_or_family_ordinal(b);
    if a_ordinal != b_ordinal {
        return tagged::relation_of(a_ordinal.cmp(&b_ordinal));
    }
    match a.domain() {
        Domain::Integer => tagged::relation_of(a.as_integer().cmp(&b.as_integer())),
        Domain::CustomTagged => {
            tagged::relation_of(tagged::get_payload(a).cmp(&tagged::get_payload(b)))
        }
        Domain::HeapObject => {
            match family_behavior(get_heap_object_family(a)).ordering_compare {
                Some(compare) => compare(a, b),
                None => tagged::new_relation(Relation::Unordered),
            }
        }
        _ => tagged::new_relation(Relation::Unordered),
    }
}

/// Sort key prefix: domain ordinal, plus the family or phylum within the
/// composite domains. Heap objects sort first so keys precede other tags.
fn domain_or_family_ordinal(value: Value) -> u64 {
    let domain_part = (value.domain().ordinal() as u64) << 32;
    match value.domain() {
        Domain::HeapObject => domain_part | get_heap_object_family(value).ordinal() as u64,
        Domain::CustomTagged => domain_part | tagged::get_phylum(value).ordinal() as u64,
        _ => domain_part,
    }
}

// ---------------------------------------------------------------------------
// Modes and freezing
// ---------------------------------------------------------------------------

/// Mode of any value. Immediates are deep frozen by construction.
pub fn get_value_mode(value: Value) -> Mode {
    match value.domain() {
        Domain::HeapObject => {
            let species = get_heap_object_species(value);
            let behavior = get_species_family_behavior(species);
            match get_species_division(species) {
                Division::Modal => get_modal_species_mode(species),
                Division::Instance => get_instance_species_raw_mode(species),
                _ => behavior.fixed_mode.unwrap_or(Mode::Mutable),
            }
        }
        _ => Mode::DeepFrozen,
    }
}

/// Sets the mode without checking the transition is legal. Modal objects swap
/// to the sibling species with the requested mode; instance objects find or
/// allocate a derivative species.
pub fn set_value_mode_unchecked(
    runtime: &mut Runtime,
    value: Value,
    mode: Mode,
) -> Result<(), Condition> {
    debug_assert!(value.is_heap_object());
    let species = get_heap_object_species(value);
    match get_species_division(species) {
        Division::Modal => {
            let base_root = get_modal_species_base_root(species);
            let sibling = runtime.roots.get_by_key(base_root + mode as usize);
            set_heap_object_species(value, sibling);
            Ok(())
        }
        Division::Instance => {
            let sibling = crate::instance::get_or_create_derivative_species(runtime, species, mode)?;
            set_heap_object_species(value, sibling);
            Ok(())
        }
        _ => Err(Condition::new(ConditionCause::InvalidModeChange)),
    }
}

/// Sets the mode, enforcing that transitions only move towards more
/// restricted modes.
pub fn set_value_mode(runtime: &mut Runtime, value: Value, mode: Mode) -> Result<(), Condition> {
    let current = get_value_mode(value);
    if current == mode {
        return Ok(());
    }
    if current > mode {
        return Err(Condition::new(ConditionCause::InvalidModeChange));
    }
    set_value_mode_unchecked(runtime, value, mode)
}

/// Freezes the value: marks it frozen and transitively freezes the values it
/// owns. Deeper references stay mutable; see validate_deep_frozen.
pub fn ensure_frozen(runtime: &mut Runtime, value: Value) -> Result<(), Condition> {
    if get_value_mode(value) >= Mode::Frozen {
        return Ok(());
    }
    set_value_mode(runtime, value, Mode::Frozen)?;
    let behavior = get_species_family_behavior(get_heap_object_species(value));
    if let Some(ensure_owned) = behavior.ensure_owned_values_frozen {
        ensure_owned(runtime, value)?;
    }
    Ok(())
}

/// Validates that everything reachable from the value is frozen, promoting
/// the whole subgraph to deep-frozen when it is. Cycle-protected; returns the
/// first offending value on failure.
pub fn validate_deep_frozen(
    runtime: &mut Runtime,
    value: Value,
    offender_out: &mut Option<Value>,
) -> Result<(), Condition> {
    let mut detector = CycleDetector::new();
    validate_deep_frozen_cycle_protect(runtime, value, offender_out, &mut detector)
}

fn validate_deep_frozen_cycle_protect(
    runtime: &mut Runtime,
    value: Value,
    offender_out: &mut Option<Value>,
    detector: &mut CycleDetector,
) -> Result<(), Condition> {
    let mode = get_value_mode(value);
    if mode == Mode::DeepFrozen {
        return Ok(());
    }
    if mode < Mode::Frozen {
        *offender_out = Some(value);
        return Err(Condition::new(ConditionCause::NotDeepFrozen));
    }
    match detector.enter(value) {
        Ok(()) => {}
        // Re-entering a frozen object mid-validation is fine; the first entry
        // is still on the stack and will finish the job.
        Err(_) => return Ok(()),
    }
    let layout = get_heap_object_layout(value);
    let addr = value.heap_object_address();
    let mut offset = layout.value_offset;
    let mut result = Ok(());
    while offset < layout.size {
        let field = Value::from_raw(crate::heap::read_word(addr + offset));
        if field.is_heap_object() {
            result = validate_deep_frozen_cycle_protect(runtime, field, offender_out, detector);
            if result.is_err() {
                break;
            }
        }
        offset += VALUE_SIZE;
    }
    detector.exit();
    if result.is_ok() {
        set_value_mode_unchecked(runtime, value, Mode::DeepFrozen)?;
    }
    result
}

/// Freezes the value and then validates the whole reachable graph, promoting
/// it to deep-frozen.
pub fn ensure_deep_frozen(runtime: &mut Runtime, value: Value) -> Result<(), Condition> {
    ensure_frozen(runtime, value)?;
    let mut offender = None;
    validate_deep_frozen(runtime, value, &mut offender)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_ordinal_roundtrip() {
        for i in 0..FAMILY_COUNT {
            assert_eq!(Family::from_ordinal(i).ordinal(), i);
        }
    }

    #[test]
    fn test_behavior_table_is_ordered_by_family() {
        for (i, behavior) in FAMILY_BEHAVIORS.iter().enumerate() {
            assert_eq!(
                behavior.family.ordinal(),
                i,
                "behavior table out of order at {}",
                behavior.family.name()
            );
        }
    }

    #[test]
    fn test_mode_ordering() {
        assert!(Mode::Fluid < Mode::Mutable);
        assert!(Mode::Mutable < Mode::Frozen);
        assert!(Mode::Frozen < Mode::DeepFrozen);
    }

    #[test]
    fn test_immediates_are_deep_frozen() {
        assert_eq!(get_value_mode(Value::new_integer(3)), Mode::DeepFrozen);
        assert_eq!(get_value_mode(crate::core::tagged::null()), Mode::DeepFrozen);
    }

    #[test]
    fn test_hash_stream_order_sensitive() {
        let mut a = HashStream::new();
        a.write_u64(1);
        a.write_u64(2);
        let mut b = HashStream::new();
        b.write_u64(2);
        b.write_u64(1);
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_cycle_detector_catches_reentry() {
        let mut detector = CycleDetector::new();
        let v = Value::new_heap_object(64);
        detector.enter(v).unwrap();
        assert!(detector.enter(v).is_err());
        detector.exit();
    }
}
