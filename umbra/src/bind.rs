/// Modules, Fragments and the Binding Schedule
///
/// A module is identified by a path and split into _fragments_, one per
/// stage: stage 0 is runtime code, stage −1 its compile-time predecessor,
/// and so on. Binding is a one-time pass before execution: the fragment
/// entry map works out which (module, stage) pairs exist and what each one
/// depends on, the schedule topologically sorts them, and then fragments
/// are created, initialized and stepped through their epochs in order.
///
/// Dependency rules: an import of module p at stage s of module m makes
/// m's stage s+u depend on p's stage u for every stage u that p carries,
/// inserting fresh empty entries in m as needed, to a fixpoint. Ties in the
/// schedule break lexicographically by module path and then oldest stage
/// first, so the order is deterministic and a module's predecessor stages
/// always bind before its later ones.

use std::collections::BTreeMap;
use std::fmt::Write;

use tracing::debug;

use crate::core::tagged::{
    get_stage_offset_value, is_nothing, new_stage_offset, nothing, relation_of,
};
use crate::core::value::{Condition, ConditionCause, LookupErrorKind, Value};
use crate::heap::{get_heap_object_field, heap_object_field_offset, set_heap_object_field, Heap};
use crate::maps;
use crate::objects::{
    add_to_array_buffer, get_array_at, get_array_buffer_at, get_array_buffer_length,
    get_array_length, get_utf8_contents,
};
use crate::runtime::{Roots, Runtime};
use crate::species::{
    self, value_identity_compare_cycle_protect, value_transient_identity_hash_cycle_protect,
    CycleDetector, Family, HashStream, PrintContext,
};

// ---------------------------------------------------------------------------
// Path
// ---------------------------------------------------------------------------

pub const PATH_RAW_HEAD_OFFSET: usize = heap_object_field_offset(0);
pub const PATH_RAW_TAIL_OFFSET: usize = heap_object_field_offset(1);
pub const PATH_FIELD_COUNT: usize = 2;

/// Head segment, or nothing for the empty path.
pub fn get_path_raw_head(path: Value) -> Value {
    get_heap_object_field(path, PATH_RAW_HEAD_OFFSET)
}

/// Tail path, or nothing for the empty path.
pub fn get_path_raw_tail(path: Value) -> Value {
    get_heap_object_field(path, PATH_RAW_TAIL_OFFSET)
}

pub fn is_path_empty(path: Value) -> bool {
    is_nothing(get_path_raw_head(path))
}

/// Builds a path from name segments, innermost last.
pub fn new_heap_path_with_names(
    heap: &mut Heap,
    roots: &Roots,
    names: &[&str],
) -> Result<Value, Condition> {
    let mut tail = crate::alloc::new_heap_path(heap, roots, nothing(), nothing())?;
    for name in names.iter().rev() {
        let head = crate::alloc::new_heap_utf8(heap, roots, name)?;
        tail = crate::alloc::new_heap_path(heap, roots, head, tail)?;
    }
    Ok(tail)
}

/// Renders a path as a `:`-joined string; the deterministic key the binding
/// schedule sorts by.
pub fn path_to_string(path: Value) -> String {
    let mut result = String::new();
    let mut current = path;
    while !is_nothing(get_path_raw_head(current)) {
        result.push(':');
        result.push_str(&get_utf8_contents(get_path_raw_head(current)));
        current = get_path_raw_tail(current);
    }
    result
}

pub fn path_validate(path: Value) -> Result<(), Condition> {
    let head = get_path_raw_head(path);
    let tail = get_path_raw_tail(path);
    if is_nothing(head) != is_nothing(tail) {
        return Err(Condition::validation_failed());
    }
    if !is_nothing(tail) && !species::in_family(Family::Path, tail) {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

pub fn path_print_on(path: Value, context: &mut PrintContext) {
    if is_path_empty(path) {
        context.buf.push_str("#<empty path>");
    } else {
        context.buf.push_str(&path_to_string(path));
    }
}

pub fn path_transient_identity_hash(
    path: Value,
    stream: &mut HashStream,
    detector: &mut CycleDetector,
) -> Result<(), Condition> {
    detector.enter(path)?;
    value_transient_identity_hash_cycle_protect(get_path_raw_head(path), stream, detector)?;
    value_transient_identity_hash_cycle_protect(get_path_raw_tail(path), stream, detector)?;
    detector.exit();
    Ok(())
}

pub fn path_identity_compare(
    a: Value,
    b: Value,
    detector: &mut CycleDetector,
) -> Result<bool, Condition> {
    detector.enter(a)?;
    let result = value_identity_compare_cycle_protect(
        get_path_raw_head(a),
        get_path_raw_head(b),
        detector,
    )? && value_identity_compare_cycle_protect(
        get_path_raw_tail(a),
        get_path_raw_tail(b),
        detector,
    )?;
    detector.exit();
    Ok(result)
}

pub fn path_ordering_compare(a: Value, b: Value) -> Value {
    relation_of(path_to_string(a).cmp(&path_to_string(b)))
}

// ---------------------------------------------------------------------------
// Identifier
// ---------------------------------------------------------------------------

pub const IDENTIFIER_STAGE_OFFSET: usize = heap_object_field_offset(0);
pub const IDENTIFIER_PATH_OFFSET: usize = heap_object_field_offset(1);
pub const IDENTIFIER_FIELD_COUNT: usize = 2;

pub fn get_identifier_stage(identifier: Value) -> Value {
    get_heap_object_field(identifier, IDENTIFIER_STAGE_OFFSET)
}

pub fn get_identifier_path(identifier: Value) -> Value {
    get_heap_object_field(identifier, IDENTIFIER_PATH_OFFSET)
}

pub fn identifier_print_on(identifier: Value, context: &mut PrintContext) {
    let _ = write!(context.buf, "@{}", get_stage_offset_value(get_identifier_stage(identifier)));
    path_print_on(get_identifier_path(identifier), context);
}

pub fn identifier_transient_identity_hash(
    identifier: Value,
    stream: &mut HashStream,
    detector: &mut CycleDetector,
) -> Result<(), Condition> {
    stream.write_u64(get_identifier_stage(identifier).raw());
    value_transient_identity_hash_cycle_protect(get_identifier_path(identifier), stream, detector)
}

pub fn identifier_identity_compare(
    a: Value,
    b: Value,
    detector: &mut CycleDetector,
) -> Result<bool, Condition> {
    if get_identifier_stage(a) != get_identifier_stage(b) {
        return Ok(false);
    }
    value_identity_compare_cycle_protect(
        get_identifier_path(a),
        get_identifier_path(b),
        detector,
    )
}

pub fn identifier_ordering_compare(a: Value, b: Value) -> Value {
    let a_stage = get_stage_offset_value(get_identifier_stage(a));
    let b_stage = get_stage_offset_value(get_identifier_stage(b));
    if a_stage != b_stage {
        return relation_of(a_stage.cmp(&b_stage));
    }
    path_ordering_compare(get_identifier_path(a), get_identifier_path(b))
}

// ---------------------------------------------------------------------------
// Bound modules and fragments
// ---------------------------------------------------------------------------

pub const MODULE_PATH_OFFSET: usize = heap_object_field_offset(0);
pub const MODULE_FRAGMENTS_OFFSET: usize = heap_object_field_offset(1);
pub const MODULE_FIELD_COUNT: usize = 2;

pub fn get_module_path(module: Value) -> Value {
    get_heap_object_field(module, MODULE_PATH_OFFSET)
}

pub fn get_module_fragments(module: Value) -> Value {
    get_heap_object_field(module, MODULE_FRAGMENTS_OFFSET)
}

/// The fragment for a stage; NotFound if the module has none.
pub fn get_module_fragment_at(module: Value, stage: i32) -> Result<Value, Condition> {
    let fragments = get_module_fragments(module);
    for i in 0..get_array_buffer_length(fragments) {
        let fragment = get_array_buffer_at(fragments, i);
        if get_stage_offset_value(get_module_fragment_stage(fragment)) == stage {
            return Ok(fragment);
        }
    }
    Err(Condition::not_found())
}

pub const MODULE_FRAGMENT_STAGE_OFFSET: usize = heap_object_field_offset(0);
pub const MODULE_FRAGMENT_MODULE_OFFSET: usize = heap_object_field_offset(1);
pub const MODULE_FRAGMENT_NAMESPACE_OFFSET: usize = heap_object_field_offset(2);
pub const MODULE_FRAGMENT_METHODSPACE_OFFSET: usize = heap_object_field_offset(3);
pub const MODULE_FRAGMENT_IMPORTS_OFFSET: usize = heap_object_field_offset(4);
pub const MODULE_FRAGMENT_EPOCH_OFFSET: usize = heap_object_field_offset(5);
pub const MODULE_FRAGMENT_PRIVATE_OFFSET: usize = heap_object_field_offset(6);
pub const MODULE_FRAGMENT_FIELD_COUNT: usize = 7;

/// Where a fragment is in its lifecycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FragmentEpoch {
    Uninitialized = 0,
    Unbound = 1,
    Binding = 2,
    Complete = 3,
}

impl FragmentEpoch {
    fn from_raw(raw: i64) -> FragmentEpoch {
        match raw {
            0 => FragmentEpoch::Uninitialized,
            1 => FragmentEpoch::Unbound,
            2 => FragmentEpoch::Binding,
            _ => FragmentEpoch::Complete,
        }
    }
}

pub fn get_module_fragment_stage(fragment: Value) -> Value {
    get_heap_object_field(fragment, MODULE_FRAGMENT_STAGE_OFFSET)
}

pub fn get_module_fragment_module(fragment: Value) -> Value {
    get_heap_object_field(fragment, MODULE_FRAGMENT_MODULE_OFFSET)
}

pub fn get_module_fragment_namespace(fragment: Value) -> Value {
    get_heap_object_field(fragment, MODULE_FRAGMENT_NAMESPACE_OFFSET)
}

pub fn get_module_fragment_methodspace(fragment: Value) -> Value {
    get_heap_object_field(fragment, MODULE_FRAGMENT_METHODSPACE_OFFSET)
}

/// Array buffer of the fragments this one imports.
pub fn get_module_fragment_imports(fragment: Value) -> Value {
    get_heap_object_field(fragment, MODULE_FRAGMENT_IMPORTS_OFFSET)
}

pub fn get_module_fragment_epoch(fragment: Value) -> FragmentEpoch {
    FragmentEpoch::from_raw(
        get_heap_object_field(fragment, MODULE_FRAGMENT_EPOCH_OFFSET).as_integer(),
    )
}

pub fn set_module_fragment_epoch(fragment: Value, epoch: FragmentEpoch) {
    set_heap_object_field(
        fragment,
        MODULE_FRAGMENT_EPOCH_OFFSET,
        Value::new_integer(epoch as i64),
    );
}

pub fn get_module_fragment_private(fragment: Value) -> Value {
    get_heap_object_field(fragment, MODULE_FRAGMENT_PRIVATE_OFFSET)
}

pub fn module_fragment_validate(fragment: Value) -> Result<(), Condition> {
    if !species::in_family(Family::Namespace, get_module_fragment_namespace(fragment)) {
        return Err(Condition::validation_failed());
    }
    if !species::in_family(Family::Methodspace, get_module_fragment_methodspace(fragment)) {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

pub const MODULE_FRAGMENT_PRIVATE_OWNER_OFFSET: usize = heap_object_field_offset(0);
pub const MODULE_FRAGMENT_PRIVATE_FIELD_COUNT: usize = 1;

pub fn get_module_fragment_private_owner(private: Value) -> Value {
    get_heap_object_field(private, MODULE_FRAGMENT_PRIVATE_OWNER_OFFSET)
}

// ---------------------------------------------------------------------------
// Unbound modules, libraries, loader
// ---------------------------------------------------------------------------

pub const UNBOUND_MODULE_PATH_OFFSET: usize = heap_object_field_offset(0);
pub const UNBOUND_MODULE_FRAGMENTS_OFFSET: usize = heap_object_field_offset(1);
pub const UNBOUND_MODULE_FIELD_COUNT: usize = 2;

pub fn get_unbound_module_path(module: Value) -> Value {
    get_heap_object_field(module, UNBOUND_MODULE_PATH_OFFSET)
}

pub fn get_unbound_module_fragments(module: Value) -> Value {
    get_heap_object_field(module, UNBOUND_MODULE_FRAGMENTS_OFFSET)
}

pub const UNBOUND_MODULE_FRAGMENT_STAGE_OFFSET: usize = heap_object_field_offset(0);
pub const UNBOUND_MODULE_FRAGMENT_IMPORTS_OFFSET: usize = heap_object_field_offset(1);
pub const UNBOUND_MODULE_FRAGMENT_ELEMENTS_OFFSET: usize = heap_object_field_offset(2);
pub const UNBOUND_MODULE_FRAGMENT_FIELD_COUNT: usize = 3;

pub fn get_unbound_module_fragment_stage(fragment: Value) -> Value {
    get_heap_object_field(fragment, UNBOUND_MODULE_FRAGMENT_STAGE_OFFSET)
}

pub fn get_unbound_module_fragment_imports(fragment: Value) -> Value {
    get_heap_object_field(fragment, UNBOUND_MODULE_FRAGMENT_IMPORTS_OFFSET)
}

pub fn get_unbound_module_fragment_elements(fragment: Value) -> Value {
    get_heap_object_field(fragment, UNBOUND_MODULE_FRAGMENT_ELEMENTS_OFFSET)
}

pub const LIBRARY_DISPLAY_NAME_OFFSET: usize = heap_object_field_offset(0);
pub const LIBRARY_MODULES_OFFSET: usize = heap_object_field_offset(1);
pub const LIBRARY_FIELD_COUNT: usize = 2;

pub fn get_library_display_name(library: Value) -> Value {
    get_heap_object_field(library, LIBRARY_DISPLAY_NAME_OFFSET)
}

pub fn get_library_modules(library: Value) -> Value {
    get_heap_object_field(library, LIBRARY_MODULES_OFFSET)
}

pub const MODULE_LOADER_MODULES_OFFSET: usize = heap_object_field_offset(0);
pub const MODULE_LOADER_FIELD_COUNT: usize = 1;

pub fn get_module_loader_modules(loader: Value) -> Value {
    get_heap_object_field(loader, MODULE_LOADER_MODULES_OFFSET)
}

/// Looks up an unbound module by path; NotFound if the loader doesn't know
/// the path.
pub fn module_loader_lookup_module(loader: Value, path: Value) -> Result<Value, Condition> {
    maps::get_id_hash_map_at(get_module_loader_modules(loader), path)
}

/// Adds the modules of a loaded library to the loader's table.
pub fn module_loader_add_library(
    heap: &mut Heap,
    roots: &Roots,
    loader: Value,
    library: Value,
) -> Result<(), Condition> {
    let modules = get_library_modules(library);
    for (path, module) in maps::IdHashMapIter::new(modules) {
        maps::set_id_hash_map_at(heap, roots, get_module_loader_modules(loader), path, module)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Namespace
// ---------------------------------------------------------------------------

pub const NAMESPACE_BINDINGS_OFFSET: usize = heap_object_field_offset(0);
pub const NAMESPACE_FIELD_COUNT: usize = 1;

/// Bindings keyed by path; path identity is structural so equal paths from
/// different sources find the same binding.
pub fn get_namespace_bindings(namespace: Value) -> Value {
    get_heap_object_field(namespace, NAMESPACE_BINDINGS_OFFSET)
}

pub fn set_namespace_binding(
    heap: &mut Heap,
    roots: &Roots,
    namespace: Value,
    path: Value,
    value: Value,
) -> Result<(), Condition> {
    maps::set_id_hash_map_at(heap, roots, get_namespace_bindings(namespace), path, value)
}

pub fn ensure_namespace_owned_values_frozen(
    runtime: &mut Runtime,
    namespace: Value,
) -> Result<(), Condition> {
    species::ensure_frozen(runtime, get_namespace_bindings(namespace))
}

/// Resolves a path through a fragment: its own namespace first, then its
/// imports, then earlier stages of the same module. Failure is a namespace
/// lookup error condition.
pub fn module_fragment_lookup_path_full(fragment: Value, path: Value) -> Result<Value, Condition> {
    let mut seen = Vec::new();
    match lookup_path_in_fragment(fragment, path, &mut seen) {
        Some(value) => Ok(value),
        None => Err(Condition::lookup_error(LookupErrorKind::Namespace)),
    }
}

fn lookup_path_in_fragment(fragment: Value, path: Value, seen: &mut Vec<u64>) -> Option<Value> {
    if seen.contains(&fragment.raw()) {
        return None;
    }
    seen.push(fragment.raw());
    let namespace = get_module_fragment_namespace(fragment);
    if let Ok(value) = maps::get_id_hash_map_at(get_namespace_bindings(namespace), path) {
        return Some(value);
    }
    let imports = get_module_fragment_imports(fragment);
    for i in 0..get_array_buffer_length(imports) {
        if let Some(value) = lookup_path_in_fragment(get_array_buffer_at(imports, i), path, seen) {
            return Some(value);
        }
    }
    // Fall back to earlier stages of the same module.
    let module = get_module_fragment_module(fragment);
    if !is_nothing(module) {
        let stage = get_stage_offset_value(get_module_fragment_stage(fragment));
        if let Ok(predecessor) = get_module_fragment_at(module, stage - 1) {
            return lookup_path_in_fragment(predecessor, path, seen);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Fragment elements
// ---------------------------------------------------------------------------

/// Kinds of declarations a fragment carries. An element is an array
/// [kind, a, b]: a namespace declaration binds path `a` to value `b`; a
/// method declaration installs method `a`; an is declaration records that
/// type `a` inherits from type `b`.
pub mod element_kind {
    pub const NAMESPACE: i64 = 0;
    pub const METHOD: i64 = 1;
    pub const IS: i64 = 2;
}

fn apply_fragment_element(
    heap: &mut Heap,
    roots: &Roots,
    fragment: Value,
    element: Value,
) -> Result<(), Condition> {
    if !species::in_family(Family::Array, element) || get_array_length(element) != 3 {
        return Err(Condition::invalid_input());
    }
    let kind = get_array_at(element, 0);
    if !kind.is_integer() {
        return Err(Condition::invalid_input());
    }
    match kind.as_integer() {
        element_kind::NAMESPACE => {
            let namespace = get_module_fragment_namespace(fragment);
            set_namespace_binding(heap, roots, namespace, get_array_at(element, 1), get_array_at(element, 2))
        }
        element_kind::METHOD => {
            let method = get_array_at(element, 1);
            // The method now belongs to the fragment being bound.
            set_heap_object_field(method, crate::method::METHOD_MODULE_FRAGMENT_OFFSET, fragment);
            crate::method::add_methodspace_method(
                heap,
                roots,
                get_module_fragment_methodspace(fragment),
                method,
            )
        }
        element_kind::IS => crate::method::add_methodspace_inheritance(
            heap,
            roots,
            get_module_fragment_methodspace(fragment),
            get_array_at(element, 1),
            get_array_at(element, 2),
        ),
        _ => Err(Condition::invalid_input()),
    }
}

// ---------------------------------------------------------------------------
// Fragment entry map and binding schedule
// ---------------------------------------------------------------------------

/// One prospective fragment in the entry map: the imports it depends on,
/// and whether a declared fragment backs it (synthesized entries exist only
/// to carry dependencies down the stages).
#[derive(Debug, Default, Clone)]
pub struct FragmentEntry {
    /// Dependencies as (module path key, stage).
    pub imports: Vec<(String, i32)>,
    pub is_synthetic: bool,
}

/// Map path key → stage → entry.
pub type FragmentEntryMap = BTreeMap<String, BTreeMap<i32, FragmentEntry>>;

/// Builds the map of every (module, stage) that participates in binding,
/// transitively closing stages downward so each import's predecessor stages
/// are represented in the importer.
pub fn build_fragment_entry_map(
    unbound_modules: &[(String, Vec<(i32, Vec<String>)>)],
) -> FragmentEntryMap {
    let mut map: FragmentEntryMap = BTreeMap::new();
    for (path, fragments) in unbound_modules {
        let stages = map.entry(path.clone()).or_default();
        for (stage, _imports) in fragments {
            stages.entry(*stage).or_default().is_synthetic = false;
        }
    }
    // Iterate to a fixpoint: every import at stage s of m pulls each stage u
    // of p into m at stage s + u, depending on (p, u).
    loop {
        let mut changed = false;
        for (path, fragments) in unbound_modules {
            for (stage, imports) in fragments {
                for import_path in imports {
                    let import_stages: Vec<i32> = map
                        .get(import_path)
                        .map(|stages| stages.keys().copied().collect())
                        .unwrap_or_default();
                    for import_stage in import_stages {
                        let target_stage = stage + import_stage;
                        let stages = map.entry(path.clone()).or_default();
                        if !stages.contains_key(&target_stage) {
                            stages.insert(
                                target_stage,
                                FragmentEntry { imports: Vec::new(), is_synthetic: true },
                            );
                            changed = true;
                        }
                        let entry = stages.get_mut(&target_stage).expect("entry just ensured");
                        let dependency = (import_path.clone(), import_stage);
                        if !entry.imports.contains(&dependency) {
                            entry.imports.push(dependency);
                            changed = true;
                        }
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }
    map
}

/// Topologically sorts the entry map: every fragment after everything it
/// imports and after its own predecessor stage. Deterministic: candidates
/// are taken lexicographically by path, oldest stage first.
pub fn build_binding_schedule(map: &FragmentEntryMap) -> Result<Vec<(String, i32)>, Condition> {
    let mut pending: Vec<(String, i32)> = Vec::new();
    for (path, stages) in map {
        for stage in stages.keys() {
            pending.push((path.clone(), *stage));
        }
    }
    pending.sort();
    let mut schedule: Vec<(String, i32)> = Vec::new();
    while !pending.is_empty() {
        let mut picked = None;
        'candidates: for (index, (path, stage)) in pending.iter().enumerate() {
            // The predecessor stage must already be scheduled.
            if pending.iter().any(|(p, s)| p == path && s < stage) {
                continue;
            }
            let entry = &map[path][stage];
            for dependency in &entry.imports {
                if pending.contains(dependency) {
                    continue 'candidates;
                }
            }
            picked = Some(index);
            break;
        }
        match picked {
            Some(index) => {
                let entry = pending.remove(index);
                debug!(module = %entry.0, stage = entry.1, "scheduling fragment");
                schedule.push(entry);
            }
            // A dependency cycle; the modules cannot be bound.
            None => return Err(Condition::new(ConditionCause::Circular)),
        }
    }
    Ok(schedule)
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// Binds every module known to the runtime's module loader. Fragments are
/// created uninitialized in schedule order, initialized from their unbound
/// elements, and stepped to the complete epoch. The bound modules land in
/// the runtime's bound-module map.
pub fn bind_modules(runtime: &mut Runtime) -> Result<(), Condition> {
    // Collect the native view of the unbound modules for the scheduler.
    let loader = runtime.roots.module_loader();
    let mut native: Vec<(String, Vec<(i32, Vec<String>)>)> = Vec::new();
    for (path, module) in maps::IdHashMapIter::new(get_module_loader_modules(loader)) {
        let mut fragments = Vec::new();
        let unbound_fragments = get_unbound_module_fragments(module);
        for i in 0..get_array_length(unbound_fragments) {
            let fragment = get_array_at(unbound_fragments, i);
            let stage = get_stage_offset_value(get_unbound_module_fragment_stage(fragment));
            let imports = get_unbound_module_fragment_imports(fragment);
            let mut import_keys = Vec::new();
            for j in 0..get_array_length(imports) {
                import_keys.push(path_to_string(get_array_at(imports, j)));
            }
            fragments.push((stage, import_keys));
        }
        native.push((path_to_string(path), fragments));
    }
    native.sort_by(|a, b| a.0.cmp(&b.0));

    let entry_map = build_fragment_entry_map(&native);
    let schedule = build_binding_schedule(&entry_map)?;

    for (path_key, stage) in &schedule {
        bind_one_fragment(runtime, path_key, *stage)?;
    }
    Ok(())
}

fn find_unbound_module_by_key(runtime: &Runtime, path_key: &str) -> Result<Value, Condition> {
    let loader = runtime.roots.module_loader();
    for (path, module) in maps::IdHashMapIter::new(get_module_loader_modules(loader)) {
        if path_to_string(path) == path_key {
            return Ok(module);
        }
    }
    Err(Condition::not_found())
}

fn find_bound_module_by_key(runtime: &Runtime, path_key: &str) -> Option<Value> {
    let bound = runtime.roots.bound_module_map();
    for (path, module) in maps::IdHashMapIter::new(bound) {
        if path_to_string(path) == path_key {
            return Some(module);
        }
    }
    None
}

fn bind_one_fragment(runtime: &mut Runtime, path_key: &str, stage: i32) -> Result<(), Condition> {
    let unbound_module = find_unbound_module_by_key(runtime, path_key)?;
    let path = get_unbound_module_path(unbound_module);

    // Find or create the bound module.
    let module = match find_bound_module_by_key(runtime, path_key) {
        Some(module) => module,
        None => {
            let (heap, roots) = runtime.heap_and_roots();
            let module = crate::alloc::new_heap_module(heap, roots, path)?;
            maps::set_id_hash_map_at(heap, roots, roots.bound_module_map(), path, module)?;
            module
        }
    };

    // Create the fragment, uninitialized.
    let (heap, roots) = runtime.heap_and_roots();
    let fragment =
        crate::alloc::new_heap_module_fragment(heap, roots, new_stage_offset(stage), module)?;
    add_to_array_buffer(heap, roots, get_module_fragments(module), fragment)?;
    set_module_fragment_epoch(fragment, FragmentEpoch::Unbound);

    // Hook up imports; the schedule guarantees they are complete by now.
    let unbound_fragment = find_unbound_fragment(unbound_module, stage);
    if let Some(unbound_fragment) = unbound_fragment {
        let imports = get_unbound_module_fragment_imports(unbound_fragment);
        for i in 0..get_array_length(imports) {
            let import_path = get_array_at(imports, i);
            let import_module = match find_bound_module_by_key(
                runtime,
                &path_to_string(import_path),
            ) {
                Some(module) => module,
                None => return Err(Condition::not_found()),
            };
            let import_fragment = get_module_fragment_at(import_module, stage)?;
            let (heap, roots) = runtime.heap_and_roots();
            add_to_array_buffer(
                heap,
                roots,
                get_module_fragment_imports(fragment),
                import_fragment,
            )?;
            crate::method::add_methodspace_import(
                heap,
                roots,
                get_module_fragment_methodspace(fragment),
                get_module_fragment_methodspace(import_fragment),
            )?;
        }
    }

    // Initialize: install the unbound elements.
    set_module_fragment_epoch(fragment, FragmentEpoch::Binding);
    if let Some(unbound_fragment) = find_unbound_fragment(unbound_module, stage) {
        let elements = get_unbound_module_fragment_elements(unbound_fragment);
        let (heap, roots) = runtime.heap_and_roots();
        for i in 0..get_array_length(elements) {
            apply_fragment_element(heap, roots, fragment, get_array_at(elements, i))?;
        }
    }
    set_module_fragment_epoch(fragment, FragmentEpoch::Complete);
    debug!(module = %path_key, stage, "fragment bound");
    Ok(())
}

fn find_unbound_fragment(unbound_module: Value, stage: i32) -> Option<Value> {
    let fragments = get_unbound_module_fragments(unbound_module);
    for i in 0..get_array_length(fragments) {
        let fragment = get_array_at(fragments, i);
        if get_stage_offset_value(get_unbound_module_fragment_stage(fragment)) == stage {
            return Some(fragment);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn module(path: &str, fragments: &[(i32, &[&str])]) -> (String, Vec<(i32, Vec<String>)>) {
        (
            path.to_string(),
            fragments
                .iter()
                .map(|(stage, imports)| {
                    (*stage, imports.iter().map(|s| s.to_string()).collect())
                })
                .collect(),
        )
    }

    fn position(schedule: &[(String, i32)], path: &str, stage: i32) -> usize {
        schedule
            .iter()
            .position(|(p, s)| p == path && *s == stage)
            .unwrap_or_else(|| panic!("{}@{} missing from schedule", path, stage))
    }

    #[test]
    fn test_schedule_orders_import_before_importer() {
        let modules = vec![
            module(":core", &[(0, &[])]),
            module(":app", &[(0, &[":core"])]),
        ];
        let map = build_fragment_entry_map(&modules);
        let schedule = build_binding_schedule(&map).unwrap();
        assert!(position(&schedule, ":core", 0) < position(&schedule, ":app", 0));
    }

    #[test]
    fn test_schedule_orders_predecessor_stage_first() {
        let modules = vec![module(":m", &[(0, &[]), (-1, &[])])];
        let map = build_fragment_entry_map(&modules);
        let schedule = build_binding_schedule(&map).unwrap();
        assert!(position(&schedule, ":m", -1) < position(&schedule, ":m", 0));
    }

    #[test]
    fn test_import_pulls_predecessor_stages_into_importer() {
        // :lib has a -1 stage, so importing it at stage 0 forces a synthetic
        // :app @-1 entry depending on :lib @-1.
        let modules = vec![
            module(":lib", &[(0, &[]), (-1, &[])]),
            module(":app", &[(0, &[":lib"])]),
        ];
        let map = build_fragment_entry_map(&modules);
        let app_stages = &map[":app"];
        assert!(app_stages.contains_key(&-1), "synthetic predecessor entry missing");
        assert!(app_stages[&-1].is_synthetic);
        assert!(app_stages[&-1].imports.contains(&(":lib".to_string(), -1)));
        let schedule = build_binding_schedule(&map).unwrap();
        assert!(position(&schedule, ":lib", -1) < position(&schedule, ":app", -1));
        assert!(position(&schedule, ":app", -1) < position(&schedule, ":app", 0));
    }

    #[test]
    fn test_schedule_is_deterministic_across_tie_breaks() {
        let modules = vec![
            module(":b", &[(0, &[])]),
            module(":a", &[(0, &[])]),
        ];
        let map = build_fragment_entry_map(&modules);
        let schedule = build_binding_schedule(&map).unwrap();
        assert_eq!(schedule[0].0, ":a");
        assert_eq!(schedule[1].0, ":b");
    }

    #[test]
    fn test_cyclic_imports_fail() {
        let modules = vec![
            module(":x", &[(0, &[":y"])]),
            module(":y", &[(0, &[":x"])]),
        ];
        let map = build_fragment_entry_map(&modules);
        assert!(build_binding_schedule(&map).is_err());
    }
}
