/// Garbage Collection — Semispace Copying
///
/// COLLECTION SEQUENCE
/// ───────────────────
///   1. Swap spaces; allocation proceeds from a fresh to-space
///   2. Migrate the root table and the strong object trackers
///   3. Scan to-space behind a scan cursor: migrate each object's header
///      (its species) and value fields; newly copied objects extend the
///      scan, so this runs to a fixpoint
///   4. Run post-migration fixups (hash maps rehash in place, since the
///      identity hashes of relocated keys changed)
///   5. Clear weak trackers whose referents did not survive; self-destruct
///      trackers run their finalizers and unlink
///   6. Free the old from-space
///
/// Derived pointers migrate by migrating their host and rebasing through
/// the anchor's host offset, which the raw byte copy preserves.

use tracing::debug;

use crate::core::tagged::nothing;
use crate::core::value::{Condition, Domain, Value, VALUE_SIZE};
use crate::heap::{
    align_size, get_heap_object_header, read_word, set_heap_object_header, tracker_flags,
    write_word, Heap, ObjectTracker,
};
use crate::runtime::Runtime;
use crate::species::{self, get_heap_object_layout};

/// Migrates one field in place, leaving immediates untouched.
fn migrate_field(heap: &mut Heap, field: &mut Value) {
    let value = *field;
    match value.domain() {
        Domain::HeapObject => {
            *field = migrate_object(heap, value);
        }
        Domain::DerivedObject => {
            let anchor_addr = value.derived_object_anchor_address();
            let anchor = Value::from_raw(read_word(anchor_addr));
            if !crate::core::tagged::in_phylum(
                crate::core::tagged::Phylum::DerivedObjectAnchor,
                anchor,
            ) {
                // A stale copy of a pointer whose section has been dissolved;
                // the anchor slot holds something else by now. Stack slots
                // above the live frames keep such copies, and chasing them
                // would walk garbage. Zap instead.
                *field = crate::core::tagged::new_freed_memory(0);
                return;
            }
            let host_offset = crate::core::tagged::get_anchor_host_offset(anchor);
            let old_host = Value::new_heap_object(anchor_addr - host_offset);
            let new_host = migrate_object(heap, old_host);
            *field =
                Value::new_derived_object(new_host.heap_object_address() + host_offset);
        }
        _ => {}
    }
}

/// Copies the object to to-space unless it already moved, installing the
/// forward pointer in the old header. Returns the to-space object.
fn migrate_object(heap: &mut Heap, old: Value) -> Value {
    debug_assert!(old.is_heap_object());
    let header = get_heap_object_header(old);
    if header.is_moved_object() {
        return header.moved_object_target();
    }
    // Objects may already live in to-space (allocated mid-gc by a fixup);
    // those don't move.
    if heap.to_space.contains(old.heap_object_address()) {
        return old;
    }
    let layout = get_heap_object_layout(old);
    let size = align_size(VALUE_SIZE, layout.size);
    let new_addr = heap
        .to_space
        .try_alloc(size)
        .expect("to-space exhausted during migration");
    unsafe {
        std::ptr::copy_nonoverlapping(
            old.heap_object_address() as *const u8,
            new_addr as *mut u8,
            layout.size,
        );
    }
    let new_object = Value::new_heap_object(new_addr);
    set_heap_object_header(old, Value::new_moved_object(new_object));
    new_object
}

/// The scan pass: walks to-space from the start, migrating each object's
/// species header and value fields. Objects whose family declares a
/// post-migration fixup are collected for the fixup pass.
fn scan_to_space(heap: &mut Heap, scan_start: usize, fixups: &mut Vec<Value>) -> usize {
    let mut scan = scan_start;
    while scan < heap.to_space.next_free() {
        let object = Value::new_heap_object(scan);
        let layout = get_heap_object_layout(object);
        // The header is the species pointer and migrates like any field.
        let header = get_heap_object_header(object);
        if header.is_heap_object() {
            set_heap_object_header(object, migrate_object(heap, header));
        }
        let addr = object.heap_object_address();
        let mut offset = layout.value_offset;
        while offset < layout.size {
            let mut field = Value::from_raw(read_word(addr + offset));
            let before = field;
            migrate_field(heap, &mut field);
            if field != before {
                write_word(addr + offset, field.raw());
            }
            offset += VALUE_SIZE;
        }
        let behavior = species::get_heap_object_family_behavior_unchecked(object);
        if behavior.post_migrate_fixup.is_some() {
            fixups.push(object);
        }
        scan += align_size(VALUE_SIZE, layout.size);
    }
    scan
}

/// A full collection.
pub fn runtime_garbage_collect(runtime: &mut Runtime) -> Result<(), Condition> {
    let Runtime { heap, roots, .. } = runtime;
    heap.prepare_gc()?;

    // Roots.
    roots.for_each_root(|slot| migrate_field(heap, slot));

    // Strong trackers. The node boxes are stable so the pointers survive
    // collecting them up front, which keeps the heap borrow simple.
    let mut nodes: Vec<*mut ObjectTracker> = Vec::with_capacity(heap.tracker_count());
    heap.for_each_tracker(|tracker| nodes.push(tracker as *mut ObjectTracker));
    for &node in &nodes {
        let tracker = unsafe { &mut *node };
        if tracker.flags & tracker_flags::ALWAYS_WEAK == 0 {
            migrate_field(heap, &mut tracker.value);
        }
    }

    // Scan until no new objects appear.
    let mut fixups = Vec::new();
    let scan_start = heap.to_space.start();
    scan_to_space(heap, scan_start, &mut fixups);

    // Weak trackers: referents that nothing else moved are dead.
    for &node in &nodes {
        let tracker = unsafe { &mut *node };
        if tracker.flags & tracker_flags::ALWAYS_WEAK != 0 && tracker.value.is_heap_object() {
            let header = get_heap_object_header(tracker.value);
            if header.is_moved_object() {
                tracker.value = header.moved_object_target();
            } else if !heap.to_space.contains(tracker.value.heap_object_address()) {
                tracker.value = nothing();
            }
        }
    }
    heap.reap_trackers(|tracker| {
        tracker.flags & tracker_flags::SELF_DESTRUCT != 0
            && crate::core::tagged::is_nothing(tracker.value)
    });

    // Fixups run once everything has settled. They rearrange in place and
    // must not allocate; the scan has already passed them.
    for object in fixups {
        let behavior = species::get_heap_object_family_behavior_unchecked(object);
        if let Some(fixup) = behavior.post_migrate_fixup {
            fixup(object);
        }
    }

    heap.complete_gc();
    runtime.gc_count += 1;
    debug!(collections = runtime.gc_count, "collection complete");
    Ok(())
}

/// Walks every object in to-space and validates it shallowly. Returns the
/// first validation failure.
pub fn validate_heap(heap: &Heap) -> Result<(), Condition> {
    let mut scan = heap.to_space.start();
    while scan < heap.to_space.next_free() {
        let object = Value::new_heap_object(scan);
        species::value_validate(object)?;
        let layout = get_heap_object_layout(object);
        // A mangled layout would stall or derail the walk itself; that
        // breach has no more specific classification.
        if layout.size < crate::heap::HEAP_OBJECT_HEADER_SIZE
            || layout.value_offset > layout.size
        {
            return Err(Condition::nothing_cause());
        }
        scan += align_size(VALUE_SIZE, layout.size);
    }
    Ok(())
}
