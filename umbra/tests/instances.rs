/// Integration tests for instances, fields and the mode discipline:
/// hard/soft field access, mode monotonicity, derivative species, the hash
/// oracle's serial limit.

use umbra::alloc;
use umbra::core::tagged::{get_hash_code_value, nothing};
use umbra::instance;
use umbra::species::{self, Mode};
use umbra::{ConditionCause, Runtime, RuntimeConfig, Value};

fn new_runtime() -> Runtime {
    let config = RuntimeConfig { semispace_size_bytes: 4 * 1024 * 1024, ..Default::default() };
    Runtime::new(config).expect("runtime should initialize")
}

fn fresh_instance(rt: &mut Runtime) -> Value {
    let (heap, roots) = rt.heap_and_roots();
    let derivatives = alloc::new_heap_array_buffer(heap, roots, 4).unwrap();
    let name = alloc::new_heap_utf8(heap, roots, "Point").unwrap();
    let type_value = alloc::new_heap_type(heap, roots, name).unwrap();
    let species = alloc::new_heap_instance_species(
        heap,
        roots,
        type_value,
        nothing(),
        Mode::Fluid,
        derivatives,
    )
    .unwrap();
    alloc::new_heap_instance(heap, roots, species).unwrap()
}

// ─── Hard fields ──────────────────────────────────────────────────────────────

#[test]
fn test_hard_field_stores_on_the_instance() {
    let mut rt = new_runtime();
    let instance = fresh_instance(&mut rt);
    let (heap, roots) = rt.heap_and_roots();
    let name = alloc::new_heap_utf8(heap, roots, "x").unwrap();
    let field = alloc::new_heap_hard_field(heap, roots, name).unwrap();
    assert!(instance::get_hard_field_value(field, instance).is_err());
    instance::set_hard_field_value(heap, roots, field, instance, Value::new_integer(3)).unwrap();
    assert_eq!(
        instance::get_hard_field_value(field, instance).unwrap().as_integer(),
        3
    );
}

#[test]
fn test_two_hard_fields_are_independent() {
    let mut rt = new_runtime();
    let instance = fresh_instance(&mut rt);
    let (heap, roots) = rt.heap_and_roots();
    let name = alloc::new_heap_utf8(heap, roots, "x").unwrap();
    let x = alloc::new_heap_hard_field(heap, roots, name).unwrap();
    let name = alloc::new_heap_utf8(heap, roots, "y").unwrap();
    let y = alloc::new_heap_hard_field(heap, roots, name).unwrap();
    instance::set_hard_field_value(heap, roots, x, instance, Value::new_integer(1)).unwrap();
    instance::set_hard_field_value(heap, roots, y, instance, Value::new_integer(2)).unwrap();
    assert_eq!(instance::get_hard_field_value(x, instance).unwrap().as_integer(), 1);
    assert_eq!(instance::get_hard_field_value(y, instance).unwrap().as_integer(), 2);
}

// ─── Soft fields and frozen holders ───────────────────────────────────────────

#[test]
fn test_soft_field_uses_the_overlay_for_frozen_holders() {
    let mut rt = new_runtime();
    let instance = fresh_instance(&mut rt);
    let field = {
        let (heap, roots) = rt.heap_and_roots();
        let name = alloc::new_heap_utf8(heap, roots, "annotation").unwrap();
        alloc::new_heap_soft_field(heap, roots, name).unwrap()
    };
    species::ensure_frozen(&mut rt, instance).unwrap();
    // The holder can't store the value itself anymore, the overlay takes it.
    let (heap, roots) = rt.heap_and_roots();
    instance::set_soft_field_value(heap, roots, field, instance, Value::new_integer(9)).unwrap();
    assert_eq!(
        instance::get_soft_field_value(field, instance).unwrap().as_integer(),
        9
    );
    // The instance's own field map stayed untouched.
    assert!(instance::get_instance_field(instance, field).is_err());
}

// ─── Modes ────────────────────────────────────────────────────────────────────

#[test]
fn test_mode_transitions_are_monotone() {
    let mut rt = new_runtime();
    let instance = fresh_instance(&mut rt);
    assert_eq!(species::get_value_mode(instance), Mode::Fluid);
    species::set_value_mode(&mut rt, instance, Mode::Mutable).unwrap();
    assert_eq!(species::get_value_mode(instance), Mode::Mutable);
    species::set_value_mode(&mut rt, instance, Mode::Frozen).unwrap();
    assert_eq!(species::get_value_mode(instance), Mode::Frozen);
    // Going back is refused.
    let result = species::set_value_mode(&mut rt, instance, Mode::Mutable);
    assert!(matches!(result, Err(c) if c.cause() == ConditionCause::InvalidModeChange));
}

#[test]
fn test_mode_change_reuses_derivative_species() {
    let mut rt = new_runtime();
    let first = fresh_instance(&mut rt);
    let second = {
        // Same species as first: allocate through the first's species.
        let species_value = umbra::species::get_heap_object_species(first);
        let (heap, roots) = rt.heap_and_roots();
        alloc::new_heap_instance(heap, roots, species_value).unwrap()
    };
    species::set_value_mode(&mut rt, first, Mode::Mutable).unwrap();
    species::set_value_mode(&mut rt, second, Mode::Mutable).unwrap();
    assert_eq!(
        umbra::species::get_heap_object_species(first),
        umbra::species::get_heap_object_species(second),
        "both instances share the mutable derivative species"
    );
}

#[test]
fn test_freezing_an_array_swaps_its_modal_species() {
    let mut rt = new_runtime();
    let array = {
        let (heap, roots) = rt.heap_and_roots();
        alloc::new_heap_array_with(heap, roots, &[Value::new_integer(1)]).unwrap()
    };
    assert_eq!(species::get_value_mode(array), Mode::Mutable);
    species::ensure_frozen(&mut rt, array).unwrap();
    assert_eq!(species::get_value_mode(array), Mode::Frozen);
    assert_eq!(umbra::objects::get_array_at(array, 0).as_integer(), 1);
}

#[test]
fn test_deep_freeze_validates_the_whole_graph() {
    let mut rt = new_runtime();
    let (inner, outer) = {
        let (heap, roots) = rt.heap_and_roots();
        let inner = alloc::new_heap_array_with(heap, roots, &[Value::new_integer(1)]).unwrap();
        let outer = alloc::new_heap_array_with(heap, roots, &[inner]).unwrap();
        (inner, outer)
    };
    // Freezing the outer array alone leaves the inner one mutable, so deep
    // freezing fails until the inner is frozen too.
    species::ensure_frozen(&mut rt, outer).unwrap();
    let mut offender = None;
    let result = species::validate_deep_frozen(&mut rt, outer, &mut offender);
    assert!(matches!(result, Err(c) if c.cause() == ConditionCause::NotDeepFrozen));
    assert_eq!(offender, Some(inner));

    species::ensure_frozen(&mut rt, inner).unwrap();
    species::ensure_deep_frozen(&mut rt, outer).unwrap();
    assert_eq!(species::get_value_mode(outer), Mode::DeepFrozen);
    assert_eq!(species::get_value_mode(inner), Mode::DeepFrozen);
}

// ─── Hash oracle ──────────────────────────────────────────────────────────────

#[test]
fn test_oracle_binds_stable_codes() {
    let mut rt = new_runtime();
    let (source, oracle, holder) = {
        let (heap, roots) = rt.heap_and_roots();
        let source = alloc::new_heap_hash_source(heap, roots, 0x1234).unwrap();
        let oracle = alloc::new_heap_hash_oracle(heap, roots, source).unwrap();
        let holder = alloc::new_heap_reference(heap, roots, nothing()).unwrap();
        (source, oracle, holder)
    };
    let (heap, roots) = rt.heap_and_roots();
    let first = instance::hash_oracle_hash_for(heap, roots, oracle, holder).unwrap();
    let again = instance::hash_oracle_hash_for(heap, roots, oracle, holder).unwrap();
    assert_eq!(first, again, "a bound code stays bound");
    let other = alloc::new_heap_reference(heap, roots, nothing()).unwrap();
    let second = instance::hash_oracle_hash_for(heap, roots, oracle, other).unwrap();
    assert_ne!(get_hash_code_value(first), get_hash_code_value(second));
    assert_eq!(instance::get_hash_source_serial(source), 2);
}

#[test]
fn test_frozen_oracle_stops_handing_out_codes() {
    let mut rt = new_runtime();
    let (oracle, bound, unbound) = {
        let (heap, roots) = rt.heap_and_roots();
        let source = alloc::new_heap_hash_source(heap, roots, 0x9).unwrap();
        let oracle = alloc::new_heap_hash_oracle(heap, roots, source).unwrap();
        let bound = alloc::new_heap_reference(heap, roots, nothing()).unwrap();
        let unbound = alloc::new_heap_reference(heap, roots, nothing()).unwrap();
        (oracle, bound, unbound)
    };
    let first = {
        let (heap, roots) = rt.heap_and_roots();
        instance::hash_oracle_hash_for(heap, roots, oracle, bound).unwrap()
    };
    species::ensure_frozen(&mut rt, oracle).unwrap();
    let (heap, roots) = rt.heap_and_roots();
    // Already bound codes stay revealed; fresh bindings are refused.
    assert_eq!(
        instance::hash_oracle_hash_for(heap, roots, oracle, bound).unwrap(),
        first
    );
    let result = instance::hash_oracle_hash_for(heap, roots, oracle, unbound);
    assert!(matches!(result, Err(c) if c.cause() == ConditionCause::InvalidModeChange));
}
