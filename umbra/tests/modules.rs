/// Integration tests for module binding and library loading: the fragment
/// schedule end to end, namespace lookup, LoadGlobal, and the plankton
/// container.

use std::io::Write;

use umbra::alloc;
use umbra::bind;
use umbra::bytecode::Assembler;
use umbra::core::tagged::{new_stage_offset, nothing};
use umbra::maps;
use umbra::plankton;
use umbra::{Runtime, RuntimeConfig, Value};

fn new_runtime() -> Runtime {
    let config = RuntimeConfig { semispace_size_bytes: 4 * 1024 * 1024, ..Default::default() };
    Runtime::new(config).expect("runtime should initialize")
}

/// Registers an unbound module with one stage-0 fragment whose elements
/// bind `binding_name` to `value`.
fn register_simple_module(
    rt: &mut Runtime,
    module_name: &str,
    imports: &[&str],
    binding_name: &str,
    value: Value,
) -> Value {
    let loader = rt.roots.module_loader();
    let (heap, roots) = rt.heap_and_roots();
    let module_path = bind::new_heap_path_with_names(heap, roots, &[module_name]).unwrap();
    let binding_path = bind::new_heap_path_with_names(heap, roots, &[binding_name]).unwrap();
    let element = alloc::new_heap_array_with(
        heap,
        roots,
        &[Value::new_integer(bind::element_kind::NAMESPACE), binding_path, value],
    )
    .unwrap();
    let elements = alloc::new_heap_array_with(heap, roots, &[element]).unwrap();
    let mut import_paths = Vec::new();
    for import in imports {
        import_paths.push(bind::new_heap_path_with_names(heap, roots, &[import]).unwrap());
    }
    let imports_array = alloc::new_heap_array_with(heap, roots, &import_paths).unwrap();
    let fragment = alloc::new_heap_unbound_module_fragment(
        heap,
        roots,
        new_stage_offset(0),
        imports_array,
        elements,
    )
    .unwrap();
    let fragments = alloc::new_heap_array_with(heap, roots, &[fragment]).unwrap();
    let module = alloc::new_heap_unbound_module(heap, roots, module_path, fragments).unwrap();
    maps::set_id_hash_map_at(
        heap,
        roots,
        bind::get_module_loader_modules(loader),
        module_path,
        module,
    )
    .unwrap();
    module_path
}

fn bound_fragment(rt: &mut Runtime, module_path: Value, stage: i32) -> Value {
    let bound = rt.roots.bound_module_map();
    let module = maps::get_id_hash_map_at(bound, module_path).expect("module should be bound");
    bind::get_module_fragment_at(module, stage).expect("fragment should exist")
}

// ─── Binding (P7 end to end) ──────────────────────────────────────────────────

#[test]
fn test_binding_installs_namespace_elements() {
    let mut rt = new_runtime();
    let module_path = register_simple_module(&mut rt, "lib", &[], "answer", Value::new_integer(42));
    bind::bind_modules(&mut rt).unwrap();

    let fragment = bound_fragment(&mut rt, module_path, 0);
    assert_eq!(bind::get_module_fragment_epoch(fragment), bind::FragmentEpoch::Complete);
    let (heap, roots) = rt.heap_and_roots();
    let probe = bind::new_heap_path_with_names(heap, roots, &["answer"]).unwrap();
    let value = bind::module_fragment_lookup_path_full(fragment, probe).unwrap();
    assert_eq!(value.as_integer(), 42);
}

#[test]
fn test_import_is_bound_first_and_visible() {
    let mut rt = new_runtime();
    let core_path = register_simple_module(&mut rt, "core", &[], "shared", Value::new_integer(9));
    let app_path = register_simple_module(&mut rt, "app", &["core"], "own", Value::new_integer(1));
    bind::bind_modules(&mut rt).unwrap();

    let app_fragment = bound_fragment(&mut rt, app_path, 0);
    // The import is hooked up and its bindings resolve through the importer.
    let (heap, roots) = rt.heap_and_roots();
    let probe = bind::new_heap_path_with_names(heap, roots, &["shared"]).unwrap();
    let value = bind::module_fragment_lookup_path_full(app_fragment, probe).unwrap();
    assert_eq!(value.as_integer(), 9);
    // And the core module exists independently.
    let core_fragment = bound_fragment(&mut rt, core_path, 0);
    let probe = {
        let (heap, roots) = rt.heap_and_roots();
        bind::new_heap_path_with_names(heap, roots, &["shared"]).unwrap()
    };
    assert_eq!(
        bind::module_fragment_lookup_path_full(core_fragment, probe).unwrap().as_integer(),
        9
    );
}

#[test]
fn test_missing_binding_is_a_namespace_lookup_error() {
    let mut rt = new_runtime();
    let module_path = register_simple_module(&mut rt, "lib", &[], "answer", Value::new_integer(1));
    bind::bind_modules(&mut rt).unwrap();
    let fragment = bound_fragment(&mut rt, module_path, 0);
    let (heap, roots) = rt.heap_and_roots();
    let probe = bind::new_heap_path_with_names(heap, roots, &["absent"]).unwrap();
    let result = bind::module_fragment_lookup_path_full(fragment, probe);
    match result {
        Err(c) => {
            assert_eq!(c.cause(), umbra::ConditionCause::LookupError);
            assert_eq!(
                c.lookup_error_kind(),
                umbra::core::value::LookupErrorKind::Namespace
            );
        }
        Ok(v) => panic!("lookup should fail, got {:?}", v),
    }
}

// ─── LoadGlobal through the interpreter ───────────────────────────────────────

#[test]
fn test_load_global_resolves_through_the_fragment() {
    let mut rt = new_runtime();
    let module_path = register_simple_module(&mut rt, "lib", &[], "answer", Value::new_integer(42));
    bind::bind_modules(&mut rt).unwrap();
    let fragment = bound_fragment(&mut rt, module_path, 0);

    let probe = {
        let (heap, roots) = rt.heap_and_roots();
        bind::new_heap_path_with_names(heap, roots, &["answer"]).unwrap()
    };
    let mut assm = Assembler::new();
    assm.emit_load_global(probe, fragment);
    assm.emit_return();
    let code = {
        let (heap, roots) = rt.heap_and_roots();
        assm.flush(heap, roots).unwrap()
    };
    let ambience = rt.new_ambience().unwrap();
    let result = umbra::run_code_block(&mut rt, ambience, code).unwrap();
    assert_eq!(result.as_integer(), 42);
}

// ─── Plankton libraries ───────────────────────────────────────────────────────

const LIBRARY_JSON: &str = r#"
{
  "$type": "core:Library",
  "name": "testlib",
  "modules": [
    {
      "$type": "core:UnboundModule",
      "path": { "$type": "core:Path", "names": ["lib"] },
      "fragments": [
        {
          "$type": "core:UnboundModuleFragment",
          "stage": 0,
          "imports": [],
          "elements": [
            [0, { "$type": "core:Path", "names": ["answer"] }, 42]
          ]
        }
      ]
    }
  ]
}
"#;

#[test]
fn test_deserialize_and_bind_a_library() {
    let mut rt = new_runtime();
    let library = plankton::deserialize_library(&mut rt, LIBRARY_JSON.as_bytes()).unwrap();
    let loader = rt.roots.module_loader();
    {
        let (heap, roots) = rt.heap_and_roots();
        bind::module_loader_add_library(heap, roots, loader, library).unwrap();
    }
    bind::bind_modules(&mut rt).unwrap();

    let probe_module = {
        let (heap, roots) = rt.heap_and_roots();
        bind::new_heap_path_with_names(heap, roots, &["lib"]).unwrap()
    };
    let fragment = bound_fragment(&mut rt, probe_module, 0);
    let probe = {
        let (heap, roots) = rt.heap_and_roots();
        bind::new_heap_path_with_names(heap, roots, &["answer"]).unwrap()
    };
    let value = bind::module_fragment_lookup_path_full(fragment, probe).unwrap();
    assert_eq!(value.as_integer(), 42);
}

#[test]
fn test_load_library_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(LIBRARY_JSON.as_bytes()).unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let mut rt = new_runtime();
    plankton::load_library_file(&mut rt, &path).unwrap();
    bind::bind_modules(&mut rt).unwrap();

    let probe_module = {
        let (heap, roots) = rt.heap_and_roots();
        bind::new_heap_path_with_names(heap, roots, &["lib"]).unwrap()
    };
    let fragment = bound_fragment(&mut rt, probe_module, 0);
    assert_eq!(bind::get_module_fragment_epoch(fragment), bind::FragmentEpoch::Complete);
}

#[test]
fn test_decoder_resolves_shared_references() {
    let mut rt = new_runtime();
    let json: serde_json::Value = serde_json::from_str(
        r#"[
            { "$type": "core:Path", "$id": "p", "names": ["shared"] },
            { "$ref": "p" }
        ]"#,
    )
    .unwrap();
    let mut decoder = plankton::Decoder::new();
    let array = decoder.decode(&mut rt, &json).unwrap();
    let first = umbra::objects::get_array_at(array, 0);
    let second = umbra::objects::get_array_at(array, 1);
    assert_eq!(first, second, "$ref must resolve to the same object");
    assert_eq!(bind::path_to_string(first), ":shared");
}

#[test]
fn test_decoder_rejects_unknown_factories() {
    let mut rt = new_runtime();
    let json: serde_json::Value =
        serde_json::from_str(r#"{ "$type": "core:NoSuchThing" }"#).unwrap();
    let mut decoder = plankton::Decoder::new();
    let result = decoder.decode(&mut rt, &json);
    assert!(matches!(result, Err(c) if c.cause() == umbra::ConditionCause::NotFound));
}

#[test]
fn test_plankton_code_block_factory() {
    // A code block [Push pool[0]; Return] with 7 in the pool, runnable.
    let mut rt = new_runtime();
    let json: serde_json::Value = serde_json::from_str(
        r#"{
            "$type": "core:CodeBlock",
            "shorts": [33, 0, 34],
            "pool": [7],
            "high_water": 2
        }"#,
    )
    .unwrap();
    let mut decoder = plankton::Decoder::new();
    let code = decoder.decode(&mut rt, &json).unwrap();
    assert!(umbra::species::in_family(umbra::Family::CodeBlock, code));
    let ambience = rt.new_ambience().unwrap();
    let result = umbra::run_code_block(&mut rt, ambience, code).unwrap();
    assert_eq!(result.as_integer(), 7);
}

#[test]
fn test_unbound_fragment_accessors() {
    let mut rt = new_runtime();
    let (heap, roots) = rt.heap_and_roots();
    let fragment = alloc::new_heap_unbound_module_fragment(
        heap,
        roots,
        new_stage_offset(-1),
        nothing(),
        nothing(),
    )
    .unwrap();
    assert_eq!(
        umbra::core::tagged::get_stage_offset_value(bind::get_unbound_module_fragment_stage(
            fragment
        )),
        -1
    );
}
