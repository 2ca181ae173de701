/// Runtime — Heap, Roots and Lifecycle
///
/// The runtime owns the heap and the root set. Roots live in one flat table
/// of values indexed by _root keys_; modal species occupy four consecutive
/// keys (one per mode) so switching an object's mode is a table lookup from
/// the species' base key. The collector visits the whole table.
///
/// Bootstrap order matters: the species of species points to itself, then
/// every family gets its species, then the auxiliary roots (well-known keys,
/// special code blocks, the argument-map trie root, the module loader) are
/// allocated using the normal constructors. The allocation fuzzer is armed
/// only after bootstrap since failing the roots would leave nothing to
/// retry.

use tracing::debug;

use crate::core::tagged::nothing;
use crate::core::value::{Condition, Domain, Value};
use crate::heap::{Heap, RuntimeConfig, SafeValue};
use crate::species::{
    self, Division, Family, Mode, FAMILY_BEHAVIORS, FAMILY_COUNT,
};

const NO_KEY: usize = usize::MAX;

// ---------------------------------------------------------------------------
// Roots
// ---------------------------------------------------------------------------

pub struct Roots {
    table: Vec<Value>,
    species_base: Vec<usize>,
    builtin_family_types: Vec<usize>,
    integer_type_key: usize,
    float32_type_key: usize,
    boolean_type_key: usize,
    null_type_key: usize,
    ascii_character_type_key: usize,
    empty_array_key: usize,
    array_of_zero_key: usize,
    empty_path_key: usize,
    subject_key_key: usize,
    selector_key_key: usize,
    is_async_key_key: usize,
    argument_map_trie_root_key: usize,
    empty_code_block_key: usize,
    stack_piece_bottom_code_block_key: usize,
    return_code_block_key: usize,
    stack_bottom_code_block_key: usize,
    empty_instance_species_key: usize,
    builtin_methodspace_key: usize,
    module_loader_key: usize,
    bound_module_map_key: usize,
    plugin_species_keys: Vec<usize>,
}

impl Roots {
    fn push(&mut self, value: Value) -> usize {
        self.table.push(value);
        self.table.len() - 1
    }

    pub fn get_by_key(&self, key: usize) -> Value {
        self.table[key]
    }

    /// The single species of a compact-division family.
    pub fn species_for(&self, family: Family) -> Value {
        let key = self.species_base[family.ordinal()];
        debug_assert_ne!(key, NO_KEY, "no species root for {}", family.name());
        self.table[key]
    }

    /// The species of a modal family in the given mode.
    pub fn modal_species(&self, family: Family, mode: Mode) -> Value {
        let base = self.species_base[family.ordinal()];
        debug_assert_ne!(base, NO_KEY, "no modal species for {}", family.name());
        self.table[base + mode as usize]
    }

    pub fn builtin_type_for_family(&self, family: Family) -> Value {
        match self.builtin_family_types[family.ordinal()] {
            NO_KEY => nothing(),
            key => self.table[key],
        }
    }

    pub fn builtin_type_for_immediate(&self, value: Value) -> Value {
        use crate::core::tagged::Phylum;
        match value.domain() {
            Domain::Integer => self.table[self.integer_type_key],
            Domain::CustomTagged => match crate::core::tagged::get_phylum(value) {
                Phylum::Boolean => self.table[self.boolean_type_key],
                Phylum::Null => self.table[self.null_type_key],
                Phylum::Float32 => self.table[self.float32_type_key],
                Phylum::AsciiCharacter => self.table[self.ascii_character_type_key],
                _ => nothing(),
            },
            _ => nothing(),
        }
    }

    pub fn empty_array(&self) -> Value {
        self.table[self.empty_array_key]
    }

    /// The one-element argument map [0]; synthetic frames with a single
    /// argument share it.
    pub fn array_of_zero(&self) -> Value {
        self.table[self.array_of_zero_key]
    }

    pub fn empty_path(&self) -> Value {
        self.table[self.empty_path_key]
    }

    pub fn subject_key(&self) -> Value {
        self.table[self.subject_key_key]
    }

    pub fn selector_key(&self) -> Value {
        self.table[self.selector_key_key]
    }

    pub fn is_async_key(&self) -> Value {
        self.table[self.is_async_key_key]
    }

    pub fn argument_map_trie_root(&self) -> Value {
        self.table[self.argument_map_trie_root_key]
    }

    pub fn empty_code_block(&self) -> Value {
        self.table[self.empty_code_block_key]
    }

    pub fn stack_piece_bottom_code_block(&self) -> Value {
        self.table[self.stack_piece_bottom_code_block_key]
    }

    pub fn return_code_block(&self) -> Value {
        self.table[self.return_code_block_key]
    }

    pub fn stack_bottom_code_block(&self) -> Value {
        self.table[self.stack_bottom_code_block_key]
    }

    pub fn empty_instance_species(&self) -> Value {
        self.table[self.empty_instance_species_key]
    }

    /// The methodspace holding the built-in methods every ambience sees.
    pub fn builtin_methodspace(&self) -> Value {
        self.table[self.builtin_methodspace_key]
    }

    pub fn module_loader(&self) -> Value {
        self.table[self.module_loader_key]
    }

    pub fn bound_module_map(&self) -> Value {
        self.table[self.bound_module_map_key]
    }

    pub fn plugin_species(&self, index: usize) -> Value {
        self.table[self.plugin_species_keys[index]]
    }

    pub fn plugin_count(&self) -> usize {
        self.plugin_species_keys.len()
    }

    /// Visits every root slot; the collector migrates through this.
    pub fn for_each_root(&mut self, mut callback: impl FnMut(&mut Value)) {
        for slot in self.table.iter_mut() {
            callback(slot);
        }
    }

    fn allocate(heap: &mut Heap, config: &RuntimeConfig) -> Result<Roots, Condition> {
        let mut roots = Roots {
            table: Vec::new(),
            species_base: vec![NO_KEY; FAMILY_COUNT],
            builtin_family_types: vec![NO_KEY; FAMILY_COUNT],
            integer_type_key: NO_KEY,
            float32_type_key: NO_KEY,
            boolean_type_key: NO_KEY,
            null_type_key: NO_KEY,
            ascii_character_type_key: NO_KEY,
            empty_array_key: NO_KEY,
            array_of_zero_key: NO_KEY,
            empty_path_key: NO_KEY,
            subject_key_key: NO_KEY,
            selector_key_key: NO_KEY,
            is_async_key_key: NO_KEY,
            argument_map_trie_root_key: NO_KEY,
            empty_code_block_key: NO_KEY,
            stack_piece_bottom_code_block_key: NO_KEY,
            return_code_block_key: NO_KEY,
            stack_bottom_code_block_key: NO_KEY,
            empty_instance_species_key: NO_KEY,
            builtin_methodspace_key: NO_KEY,
            module_loader_key: NO_KEY,
            bound_module_map_key: NO_KEY,
            plugin_species_keys: Vec::new(),
        };

        // The species of species: its own header points to itself.
        let species_species = {
            let addr = heap.try_alloc(species::species_size(Division::Compact))?;
            let obj = Value::new_heap_object(addr);
            crate::heap::set_heap_object_header(obj, obj);
            crate::heap::set_heap_object_field(
                obj,
                species::SPECIES_FAMILY_OFFSET,
                Value::new_integer(Family::Species.ordinal() as i64),
            );
            crate::heap::set_heap_object_field(
                obj,
                species::SPECIES_BEHAVIOR_OFFSET,
                Value::new_integer(Family::Species.ordinal() as i64),
            );
            crate::heap::set_heap_object_field(
                obj,
                species::SPECIES_DIVISION_OFFSET,
                Value::new_integer(Division::Compact as i64),
            );
            obj
        };
        let species_species_key = roots.push(species_species);
        roots.species_base[Family::Species.ordinal()] = species_species_key;

        // Species for every other family. Modal families get a block of four
        // siblings, one per mode, linked through their base root key.
        for ordinal in 0..FAMILY_COUNT {
            let family = Family::from_ordinal(ordinal);
            if family == Family::Species {
                continue;
            }
            let behavior = &FAMILY_BEHAVIORS[ordinal];
            match behavior.division {
                Division::Compact => {
                    let species_value =
                        crate::alloc::new_heap_compact_species(heap, species_species, family)?;
                    let key = roots.push(species_value);
                    roots.species_base[ordinal] = key;
                }
                Division::Modal => {
                    let base_key = roots.table.len();
                    for mode in [Mode::Fluid, Mode::Mutable, Mode::Frozen, Mode::DeepFrozen] {
                        let species_value = crate::alloc::new_heap_modal_species(
                            heap,
                            species_species,
                            family,
                            mode,
                            base_key,
                        )?;
                        roots.push(species_value);
                    }
                    roots.species_base[ordinal] = base_key;
                }
                // Instance and c-object species are allocated per type and
                // per plugin below.
                Division::Instance | Division::CObject => {}
            }
        }

        // Simple auxiliary roots.
        let empty_array = crate::alloc::new_heap_array(heap, &roots, 0)?;
        roots.empty_array_key = roots.push(empty_array);
        let array_of_zero = crate::alloc::new_heap_array_with(heap, &roots, &[Value::new_integer(0)])?;
        roots.array_of_zero_key = roots.push(array_of_zero);
        let empty_path = crate::alloc::new_heap_path(heap, &roots, nothing(), nothing())?;
        roots.empty_path_key = roots.push(empty_path);

        // The well-known keys with their fixed ids.
        for (index, name) in ["subject", "selector", "is_async"].into_iter().enumerate() {
            let display_name = crate::alloc::new_heap_utf8(heap, &roots, name)?;
            let key = crate::alloc::new_heap_key(heap, &roots, index as i64, display_name)?;
            let pushed = roots.push(key);
            match index {
                0 => roots.subject_key_key = pushed,
                1 => roots.selector_key_key = pushed,
                _ => roots.is_async_key_key = pushed,
            }
        }

        // The root of the argument map trie; its value is the empty map.
        let trie_root = crate::alloc::new_heap_argument_map_trie(heap, &roots, empty_array)?;
        roots.argument_map_trie_root_key = roots.push(trie_root);

        // Special code blocks the stack machinery relies on.
        let empty_code_block = {
            let assm = crate::bytecode::Assembler::new();
            assm.flush(heap, &roots)?
        };
        roots.empty_code_block_key = roots.push(empty_code_block);
        let stack_piece_bottom_code_block = {
            let mut assm = crate::bytecode::Assembler::new();
            assm.emit_stack_piece_bottom();
            assm.flush(heap, &roots)?
        };
        roots.stack_piece_bottom_code_block_key = roots.push(stack_piece_bottom_code_block);
        let return_code_block = {
            let mut assm = crate::bytecode::Assembler::new();
            assm.emit_return();
            assm.flush(heap, &roots)?
        };
        roots.return_code_block_key = roots.push(return_code_block);
        let stack_bottom_code_block = {
            let mut assm = crate::bytecode::Assembler::new();
            assm.emit_stack_bottom();
            assm.flush(heap, &roots)?
        };
        roots.stack_bottom_code_block_key = roots.push(stack_bottom_code_block);

        // Built-in types for values that don't carry a species type.
        let mut make_type = |heap: &mut Heap, roots: &mut Roots, name: &str| -> Result<usize, Condition> {
            let display_name = crate::alloc::new_heap_utf8(heap, roots, name)?;
            let type_value = crate::alloc::new_heap_type(heap, roots, display_name)?;
            Ok(roots.push(type_value))
        };
        roots.integer_type_key = make_type(heap, &mut roots, "Integer")?;
        roots.float32_type_key = make_type(heap, &mut roots, "Float32")?;
        roots.boolean_type_key = make_type(heap, &mut roots, "Bool")?;
        roots.null_type_key = make_type(heap, &mut roots, "Null")?;
        roots.ascii_character_type_key = make_type(heap, &mut roots, "AsciiCharacter")?;
        for (family, name) in [
            (Family::Utf8, "String"),
            (Family::Blob, "Blob"),
            (Family::Array, "Array"),
            (Family::ArrayBuffer, "ArrayBuffer"),
            (Family::IdHashMap, "Map"),
            (Family::Lambda, "Lambda"),
            (Family::Block, "Block"),
            (Family::Escape, "Escape"),
            (Family::Promise, "Promise"),
            (Family::Type, "Type"),
            (Family::Key, "Key"),
            (Family::Path, "Path"),
            (Family::Backtrace, "Backtrace"),
        ] {
            let key = make_type(heap, &mut roots, name)?;
            roots.builtin_family_types[family.ordinal()] = key;
        }

        // The shared fluid instance species plankton instantiation starts
        // from; mode changes derive siblings through the derivatives buffer.
        let derivatives = crate::alloc::new_heap_array_buffer(heap, &roots, 4)?;
        let empty_instance_species = crate::alloc::new_heap_instance_species(
            heap,
            &roots,
            nothing(),
            nothing(),
            Mode::Fluid,
            derivatives,
        )?;
        roots.empty_instance_species_key = roots.push(empty_instance_species);

        // Plugin c-object species.
        for plugin in &config.plugins {
            let type_name = crate::alloc::new_heap_utf8(heap, &roots, "CObject")?;
            let type_value = crate::alloc::new_heap_type(heap, &roots, type_name)?;
            let type_key = roots.push(type_value);
            let species_value = crate::alloc::new_heap_c_object_species(
                heap,
                species_species,
                *plugin,
                roots.table[type_key],
            )?;
            let key = roots.push(species_value);
            roots.plugin_species_keys.push(key);
        }

        // Built-in methods and module state.
        let builtin_methodspace = crate::alloc::new_heap_methodspace(heap, &roots)?;
        roots.builtin_methodspace_key = roots.push(builtin_methodspace);
        let module_loader = crate::alloc::new_heap_module_loader(heap, &roots)?;
        roots.module_loader_key = roots.push(module_loader);
        let bound_module_map = crate::alloc::new_heap_id_hash_map(heap, &roots, 16)?;
        roots.bound_module_map_key = roots.push(bound_module_map);

        Ok(roots)
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct Runtime {
    pub heap: Heap,
    pub roots: Roots,
    /// Next id handed out for fresh keys; the well-known keys take 0..3.
    pub next_key_id: i64,
    /// The background I/O engine; lazily started on first use.
    pub io_engine: Option<crate::io::IoEngine>,
    /// Counts collections, for logging and test introspection.
    pub gc_count: u64,
    /// Rendering of the backtrace captured for the last escaped signal.
    pub last_backtrace: Option<String>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Runtime, Condition> {
        let mut heap = Heap::new(config.clone())?;
        let roots = Roots::allocate(&mut heap, &config)?;
        let mut runtime = Runtime {
            heap,
            roots,
            next_key_id: 3,
            io_engine: None,
            gc_count: 0,
            last_backtrace: None,
        };
        crate::intrinsics::register_builtin_methods(&mut runtime)?;
        runtime.heap.enable_fuzzing();
        debug!(roots = runtime.roots.table.len(), "runtime initialized");
        Ok(runtime)
    }

    /// Splits the borrow so allocation can see the roots.
    pub fn heap_and_roots(&mut self) -> (&mut Heap, &Roots) {
        (&mut self.heap, &self.roots)
    }

    /// Protects a value across collections and allocations.
    pub fn protect(&mut self, value: Value) -> SafeValue {
        self.heap.new_tracker(value, 0, None)
    }

    pub fn unprotect(&mut self, handle: SafeValue) {
        self.heap.dispose_tracker(handle);
    }

    pub fn fresh_key_id(&mut self) -> i64 {
        let id = self.next_key_id;
        self.next_key_id += 1;
        id
    }

    /// A new ambience seeing the built-in methods.
    pub fn new_ambience(&mut self) -> Result<Value, Condition> {
        let (heap, roots) = self.heap_and_roots();
        crate::alloc::new_heap_ambience(heap, roots, roots.builtin_methodspace())
    }

    pub fn garbage_collect(&mut self) -> Result<(), Condition> {
        crate::gc::runtime_garbage_collect(self)
    }

    /// Walks every object in to-space and validates it shallowly.
    pub fn validate_heap(&self) -> Result<(), Condition> {
        crate::gc::validate_heap(&self.heap)
    }

    /// The engine, started on first use.
    pub fn io_engine(&mut self) -> &crate::io::IoEngine {
        if self.io_engine.is_none() {
            self.io_engine = Some(crate::io::IoEngine::start());
        }
        self.io_engine.as_ref().unwrap()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Some(engine) = self.io_engine.take() {
            engine.shut_down();
        }
    }
}
