/// Plankton Deserialization — Libraries Through Factories
///
/// The runtime consumes pre-compiled libraries. The wire container is JSON;
/// what matters to the core is the _environment_: a registry from type
/// names (`"core:Path"`, `"core:Method"`, …) to factories. A factory makes
/// a half-constructed instance, then populates it from a contents map in a
/// second phase, which is what lets cyclic structures deserialize. Factories
/// freeze their results when deep-frozen semantics apply.
///
/// Shared structure uses `"$id"`/`"$ref"` markers; typed nodes carry
/// `"$type"`. Everything else maps structurally: numbers to integers,
/// strings to utf8, arrays to arrays, plain objects to id hash maps.

use std::collections::HashMap;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::core::tagged::{new_boolean, new_stage_offset, nothing, null};
use crate::core::value::{Condition, ConditionCause, Value};
use crate::heap::{set_heap_object_field, Heap};
use crate::maps;
use crate::objects::get_utf8_contents;
use crate::runtime::{Roots, Runtime};
use crate::species::{self, Family};

// ---------------------------------------------------------------------------
// The environment
// ---------------------------------------------------------------------------

/// Two-phase construction hooks for one type name.
#[derive(Clone, Copy)]
pub struct FactoryFns {
    /// Returns a half-constructed object.
    pub new_instance: fn(&mut Runtime) -> Result<Value, Condition>,
    /// Populates it from the contents map (utf8 keys to values).
    pub set_contents: fn(Value, &mut Runtime, Value) -> Result<(), Condition>,
}

/// The process-wide factory registry. Registered once at startup; tests may
/// substitute entries and restore them afterwards.
static ENVIRONMENT: Lazy<DashMap<String, FactoryFns>> = Lazy::new(|| {
    let environment = DashMap::new();
    install_core_factories(&environment);
    environment
});

pub fn register_factory(name: &str, fns: FactoryFns) -> Option<FactoryFns> {
    ENVIRONMENT.insert(name.to_string(), fns)
}

pub fn lookup_factory(name: &str) -> Option<FactoryFns> {
    ENVIRONMENT.get(name).map(|entry| *entry.value())
}

// ---------------------------------------------------------------------------
// Contents helpers
// ---------------------------------------------------------------------------

fn contents_get(
    heap: &mut Heap,
    roots: &Roots,
    contents: Value,
    name: &str,
) -> Result<Value, Condition> {
    let key = crate::alloc::new_heap_utf8(heap, roots, name)?;
    maps::get_id_hash_map_at(contents, key)
}

fn contents_get_opt(heap: &mut Heap, roots: &Roots, contents: Value, name: &str) -> Value {
    contents_get(heap, roots, contents, name).unwrap_or_else(|_| nothing())
}

fn expect_integer(value: Value) -> Result<i64, Condition> {
    if !value.is_integer() {
        return Err(Condition::invalid_input());
    }
    Ok(value.as_integer())
}

// ---------------------------------------------------------------------------
// Core factories
// ---------------------------------------------------------------------------

fn path_new_instance(runtime: &mut Runtime) -> Result<Value, Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    crate::alloc::new_heap_path(heap, roots, nothing(), nothing())
}

/// Contents: {"names": ["a", "b", …]}.
fn path_set_contents(object: Value, runtime: &mut Runtime, contents: Value) -> Result<(), Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let names = contents_get(heap, roots, contents, "names")?;
    if !species::in_family(Family::Array, names) {
        return Err(Condition::invalid_input());
    }
    let count = crate::objects::get_array_length(names);
    let mut tail = crate::alloc::new_heap_path(heap, roots, nothing(), nothing())?;
    for i in (1..count).rev() {
        let head = crate::objects::get_array_at(names, i);
        tail = crate::alloc::new_heap_path(heap, roots, head, tail)?;
    }
    if count > 0 {
        set_heap_object_field(
            object,
            crate::bind::PATH_RAW_HEAD_OFFSET,
            crate::objects::get_array_at(names, 0),
        );
        set_heap_object_field(object, crate::bind::PATH_RAW_TAIL_OFFSET, tail);
    }
    species::ensure_deep_frozen(runtime, object)
}

fn identifier_new_instance(runtime: &mut Runtime) -> Result<Value, Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    crate::alloc::new_heap_identifier(heap, roots, new_stage_offset(0), nothing())
}

fn identifier_set_contents(
    object: Value,
    runtime: &mut Runtime,
    contents: Value,
) -> Result<(), Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let stage = expect_integer(contents_get(heap, roots, contents, "stage")?)?;
    let path = contents_get(heap, roots, contents, "path")?;
    set_heap_object_field(
        object,
        crate::bind::IDENTIFIER_STAGE_OFFSET,
        new_stage_offset(stage as i32),
    );
    set_heap_object_field(object, crate::bind::IDENTIFIER_PATH_OFFSET, path);
    species::ensure_deep_frozen(runtime, object)
}

fn type_new_instance(runtime: &mut Runtime) -> Result<Value, Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    crate::alloc::new_heap_type(heap, roots, nothing())
}

fn type_set_contents(object: Value, runtime: &mut Runtime, contents: Value) -> Result<(), Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let name = contents_get_opt(heap, roots, contents, "name");
    crate::instance::set_type_display_name(object, name);
    species::ensure_frozen(runtime, object)
}

fn operation_new_instance(runtime: &mut Runtime) -> Result<Value, Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    crate::alloc::new_heap_operation(heap, roots, crate::objects::OperationType::Call, nothing())
}

fn operation_set_contents(
    object: Value,
    runtime: &mut Runtime,
    contents: Value,
) -> Result<(), Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let raw_type = expect_integer(contents_get(heap, roots, contents, "type")?)?;
    let value = contents_get_opt(heap, roots, contents, "value");
    crate::objects::set_operation_type(object, crate::objects::OperationType::from_raw(raw_type));
    crate::objects::set_operation_value(object, value);
    species::ensure_deep_frozen(runtime, object)
}

fn unbound_module_new_instance(runtime: &mut Runtime) -> Result<Value, Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    crate::alloc::new_heap_unbound_module(heap, roots, nothing(), nothing())
}

fn unbound_module_set_contents(
    object: Value,
    runtime: &mut Runtime,
    contents: Value,
) -> Result<(), Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let path = contents_get(heap, roots, contents, "path")?;
    let fragments = contents_get(heap, roots, contents, "fragments")?;
    set_heap_object_field(object, crate::bind::UNBOUND_MODULE_PATH_OFFSET, path);
    set_heap_object_field(object, crate::bind::UNBOUND_MODULE_FRAGMENTS_OFFSET, fragments);
    Ok(())
}

fn unbound_fragment_new_instance(runtime: &mut Runtime) -> Result<Value, Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    crate::alloc::new_heap_unbound_module_fragment(
        heap,
        roots,
        new_stage_offset(0),
        nothing(),
        nothing(),
    )
}

fn unbound_fragment_set_contents(
    object: Value,
    runtime: &mut Runtime,
    contents: Value,
) -> Result<(), Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let stage = expect_integer(contents_get(heap, roots, contents, "stage")?)?;
    let imports = contents_get(heap, roots, contents, "imports")?;
    let elements = contents_get(heap, roots, contents, "elements")?;
    set_heap_object_field(
        object,
        crate::bind::UNBOUND_MODULE_FRAGMENT_STAGE_OFFSET,
        new_stage_offset(stage as i32),
    );
    set_heap_object_field(object, crate::bind::UNBOUND_MODULE_FRAGMENT_IMPORTS_OFFSET, imports);
    set_heap_object_field(object, crate::bind::UNBOUND_MODULE_FRAGMENT_ELEMENTS_OFFSET, elements);
    Ok(())
}

fn library_new_instance(runtime: &mut Runtime) -> Result<Value, Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let modules = crate::alloc::new_heap_id_hash_map(heap, roots, 16)?;
    crate::alloc::new_heap_library(heap, roots, nothing(), modules)
}

/// Contents: {"name": …, "modules": [module, …]}; the module map is keyed
/// by each module's own path.
fn library_set_contents(
    object: Value,
    runtime: &mut Runtime,
    contents: Value,
) -> Result<(), Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let name = contents_get_opt(heap, roots, contents, "name");
    set_heap_object_field(object, crate::bind::LIBRARY_DISPLAY_NAME_OFFSET, name);
    let modules = contents_get(heap, roots, contents, "modules")?;
    if !species::in_family(Family::Array, modules) {
        return Err(Condition::invalid_input());
    }
    let map = crate::bind::get_library_modules(object);
    for i in 0..crate::objects::get_array_length(modules) {
        let module = crate::objects::get_array_at(modules, i);
        if !species::in_family(Family::UnboundModule, module) {
            return Err(Condition::invalid_input());
        }
        let path = crate::bind::get_unbound_module_path(module);
        maps::set_id_hash_map_at(heap, roots, map, path, module)?;
    }
    Ok(())
}

fn guard_new_instance(runtime: &mut Runtime) -> Result<Value, Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    crate::alloc::new_heap_guard(heap, roots, crate::method::GuardType::Any, nothing())
}

fn guard_set_contents(object: Value, runtime: &mut Runtime, contents: Value) -> Result<(), Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let raw_type = expect_integer(contents_get(heap, roots, contents, "type")?)?;
    let value = contents_get_opt(heap, roots, contents, "value");
    let guard_type = match raw_type {
        0 => crate::method::GuardType::Eq,
        1 => crate::method::GuardType::Is,
        _ => crate::method::GuardType::Any,
    };
    set_heap_object_field(
        object,
        crate::method::GUARD_TYPE_OFFSET,
        Value::new_integer(guard_type as i64),
    );
    set_heap_object_field(object, crate::method::GUARD_VALUE_OFFSET, value);
    species::ensure_frozen(runtime, object)
}

fn parameter_new_instance(runtime: &mut Runtime) -> Result<Value, Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    crate::alloc::new_heap_parameter(heap, roots, nothing(), nothing(), false, 0)
}

fn parameter_set_contents(
    object: Value,
    runtime: &mut Runtime,
    contents: Value,
) -> Result<(), Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let guard = contents_get(heap, roots, contents, "guard")?;
    let tags = contents_get(heap, roots, contents, "tags")?;
    let index = expect_integer(contents_get(heap, roots, contents, "index")?)?;
    let optional = contents_get_opt(heap, roots, contents, "optional");
    set_heap_object_field(object, crate::method::PARAMETER_GUARD_OFFSET, guard);
    set_heap_object_field(object, crate::method::PARAMETER_TAGS_OFFSET, tags);
    set_heap_object_field(
        object,
        crate::method::PARAMETER_INDEX_OFFSET,
        Value::new_integer(index),
    );
    set_heap_object_field(
        object,
        crate::method::PARAMETER_IS_OPTIONAL_OFFSET,
        if crate::core::tagged::in_phylum(crate::core::tagged::Phylum::Boolean, optional) {
            optional
        } else {
            new_boolean(false)
        },
    );
    species::ensure_frozen(runtime, object)
}

fn signature_new_instance(runtime: &mut Runtime) -> Result<Value, Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let tags = roots.empty_array();
    crate::alloc::new_heap_signature(heap, roots, tags, 0, 0, false)
}

/// Contents: {"tags": pair array, "parameters": n, "mandatory": n,
/// "allow_extra": bool}. The pair array arrives in any order and is sorted
/// here.
fn signature_set_contents(
    object: Value,
    runtime: &mut Runtime,
    contents: Value,
) -> Result<(), Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let tags = contents_get(heap, roots, contents, "tags")?;
    let parameter_count = expect_integer(contents_get(heap, roots, contents, "parameters")?)?;
    let mandatory_count = expect_integer(contents_get(heap, roots, contents, "mandatory")?)?;
    let allow_extra = contents_get_opt(heap, roots, contents, "allow_extra");
    crate::objects::co_sort_pair_array(tags);
    crate::method::set_signature_tags(object, tags);
    crate::method::set_signature_parameter_count(object, parameter_count as usize);
    crate::method::set_signature_mandatory_count(object, mandatory_count as usize);
    crate::method::set_signature_allow_extra(
        object,
        crate::core::tagged::in_phylum(crate::core::tagged::Phylum::Boolean, allow_extra)
            && crate::core::tagged::get_boolean_value(allow_extra),
    );
    species::ensure_frozen(runtime, object)
}

fn code_block_new_instance(runtime: &mut Runtime) -> Result<Value, Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let bytecode = crate::alloc::new_heap_blob(heap, roots, 0)?;
    crate::alloc::new_heap_code_block(heap, roots, bytecode, roots.empty_array(), 1)
}

/// Contents: {"shorts": [u16, …], "pool": [value, …], "high_water": n}.
fn code_block_set_contents(
    object: Value,
    runtime: &mut Runtime,
    contents: Value,
) -> Result<(), Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let shorts = contents_get(heap, roots, contents, "shorts")?;
    let pool = contents_get(heap, roots, contents, "pool")?;
    let high_water = expect_integer(contents_get(heap, roots, contents, "high_water")?)?;
    if !species::in_family(Family::Array, shorts) || !species::in_family(Family::Array, pool) {
        return Err(Condition::invalid_input());
    }
    let count = crate::objects::get_array_length(shorts);
    let mut bytes = Vec::with_capacity(count * 2);
    for i in 0..count {
        let short = expect_integer(crate::objects::get_array_at(shorts, i))? as u16;
        bytes.extend_from_slice(&short.to_le_bytes());
    }
    let bytecode = crate::alloc::new_heap_blob_with_data(heap, roots, &bytes)?;
    set_heap_object_field(object, crate::bytecode::CODE_BLOCK_BYTECODE_OFFSET, bytecode);
    set_heap_object_field(object, crate::bytecode::CODE_BLOCK_VALUE_POOL_OFFSET, pool);
    crate::bytecode::set_code_block_high_water_mark(object, high_water as usize);
    Ok(())
}

fn method_new_instance(runtime: &mut Runtime) -> Result<Value, Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    crate::alloc::new_heap_method(heap, roots, nothing(), nothing(), nothing(), nothing(), 0)
}

fn method_set_contents(
    object: Value,
    runtime: &mut Runtime,
    contents: Value,
) -> Result<(), Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let signature = contents_get(heap, roots, contents, "signature")?;
    let code = contents_get_opt(heap, roots, contents, "code");
    set_heap_object_field(object, crate::method::METHOD_SIGNATURE_OFFSET, signature);
    set_heap_object_field(object, crate::method::METHOD_CODE_OFFSET, code);
    Ok(())
}

fn install_core_factories(environment: &DashMap<String, FactoryFns>) {
    let entries: [(&str, FactoryFns); 11] = [
        ("core:Path", FactoryFns { new_instance: path_new_instance, set_contents: path_set_contents }),
        (
            "core:Identifier",
            FactoryFns { new_instance: identifier_new_instance, set_contents: identifier_set_contents },
        ),
        ("core:Type", FactoryFns { new_instance: type_new_instance, set_contents: type_set_contents }),
        (
            "core:Operation",
            FactoryFns { new_instance: operation_new_instance, set_contents: operation_set_contents },
        ),
        (
            "core:UnboundModule",
            FactoryFns {
                new_instance: unbound_module_new_instance,
                set_contents: unbound_module_set_contents,
            },
        ),
        (
            "core:UnboundModuleFragment",
            FactoryFns {
                new_instance: unbound_fragment_new_instance,
                set_contents: unbound_fragment_set_contents,
            },
        ),
        (
            "core:Library",
            FactoryFns { new_instance: library_new_instance, set_contents: library_set_contents },
        ),
        ("core:Guard", FactoryFns { new_instance: guard_new_instance, set_contents: guard_set_contents }),
        (
            "core:Parameter",
            FactoryFns { new_instance: parameter_new_instance, set_contents: parameter_set_contents },
        ),
        (
            "core:Signature",
            FactoryFns { new_instance: signature_new_instance, set_contents: signature_set_contents },
        ),
        (
            "core:CodeBlock",
            FactoryFns { new_instance: code_block_new_instance, set_contents: code_block_set_contents },
        ),
    ];
    for (name, fns) in entries {
        environment.insert(name.to_string(), fns);
    }
    environment.insert(
        "core:Method".to_string(),
        FactoryFns { new_instance: method_new_instance, set_contents: method_set_contents },
    );
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decodes a JSON tree into runtime values, resolving `$type` nodes through
/// the environment and `$id`/`$ref` for shared structure.
pub struct Decoder {
    seen: HashMap<String, Value>,
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder { seen: HashMap::new() }
    }

    pub fn decode(
        &mut self,
        runtime: &mut Runtime,
        node: &serde_json::Value,
    ) -> Result<Value, Condition> {
        match node {
            serde_json::Value::Null => Ok(null()),
            serde_json::Value::Bool(flag) => Ok(new_boolean(*flag)),
            serde_json::Value::Number(number) => match number.as_i64() {
                Some(value) => Ok(Value::new_integer(value)),
                None => Err(Condition::invalid_input()),
            },
            serde_json::Value::String(text) => {
                let (heap, roots) = runtime.heap_and_roots();
                crate::alloc::new_heap_utf8(heap, roots, text)
            }
            serde_json::Value::Array(items) => {
                let array = {
                    let (heap, roots) = runtime.heap_and_roots();
                    crate::alloc::new_heap_array(heap, roots, items.len())?
                };
                for (i, item) in items.iter().enumerate() {
                    let value = self.decode(runtime, item)?;
                    crate::objects::set_array_at(array, i, value);
                }
                Ok(array)
            }
            serde_json::Value::Object(fields) => self.decode_object(runtime, fields),
        }
    }

    fn decode_object(
        &mut self,
        runtime: &mut Runtime,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Value, Condition> {
        if let Some(serde_json::Value::String(reference)) = fields.get("$ref") {
            return self
                .seen
                .get(reference)
                .copied()
                .ok_or_else(Condition::invalid_input);
        }
        let type_name = match fields.get("$type") {
            Some(serde_json::Value::String(name)) => Some(name.clone()),
            _ => None,
        };
        let object = match &type_name {
            Some(name) => {
                let factory = lookup_factory(name)
                    .ok_or_else(|| Condition::new(ConditionCause::NotFound))?;
                (factory.new_instance)(runtime)?
            }
            None => {
                let (heap, roots) = runtime.heap_and_roots();
                crate::alloc::new_heap_id_hash_map(heap, roots, 16)?
            }
        };
        // Register before recursing so cycles resolve to the half-built
        // object.
        if let Some(serde_json::Value::String(id)) = fields.get("$id") {
            self.seen.insert(id.clone(), object);
        }
        // Decode the contents into a map.
        let contents = {
            let (heap, roots) = runtime.heap_and_roots();
            crate::alloc::new_heap_id_hash_map(heap, roots, 16)?
        };
        for (key, value) in fields {
            if key.starts_with('$') {
                continue;
            }
            let decoded = self.decode(runtime, value)?;
            let (heap, roots) = runtime.heap_and_roots();
            let key_value = crate::alloc::new_heap_utf8(heap, roots, key)?;
            maps::set_id_hash_map_at(heap, roots, contents, key_value, decoded)?;
        }
        match type_name {
            Some(name) => {
                let factory = lookup_factory(&name).expect("factory disappeared");
                (factory.set_contents)(object, runtime, contents)?;
                Ok(object)
            }
            None => Ok(contents),
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new()
    }
}

// ---------------------------------------------------------------------------
// Library loading
// ---------------------------------------------------------------------------

/// Parses a serialized library and returns the Library value.
pub fn deserialize_library(runtime: &mut Runtime, bytes: &[u8]) -> Result<Value, Condition> {
    let node: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|_| Condition::new(ConditionCause::InvalidSyntax))?;
    let mut decoder = Decoder::new();
    let library = decoder.decode(runtime, &node)?;
    if !species::in_family(Family::Library, library) {
        return Err(Condition::invalid_input());
    }
    Ok(library)
}

/// Reads a library file and adds its modules to the runtime's loader.
pub fn load_library_file(runtime: &mut Runtime, path: &str) -> Result<(), Condition> {
    let blob = crate::io::read_file_to_blob(runtime, path)?;
    let bytes = crate::objects::get_blob_data(blob);
    let library = deserialize_library(runtime, &bytes)?;
    let loader = runtime.roots.module_loader();
    let (heap, roots) = runtime.heap_and_roots();
    crate::bind::module_loader_add_library(heap, roots, loader, library)
}

/// Applies module load options: an id hash map whose "libraries" entry is
/// an array of library path strings.
pub fn module_loader_process_options(runtime: &mut Runtime, options: Value) -> Result<(), Condition> {
    if !species::in_family(Family::IdHashMap, options) {
        return Err(Condition::invalid_input());
    }
    let libraries = {
        let (heap, roots) = runtime.heap_and_roots();
        match contents_get(heap, roots, options, "libraries") {
            Ok(libraries) => libraries,
            Err(_) => return Ok(()),
        }
    };
    for i in 0..crate::objects::get_array_length(libraries) {
        let path = crate::objects::get_array_at(libraries, i);
        if !species::in_family(Family::Utf8, path) {
            return Err(Condition::invalid_input());
        }
        let path_text = get_utf8_contents(path);
        load_library_file(runtime, &path_text)?;
    }
    Ok(())
}
