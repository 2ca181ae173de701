/// IdHashMap and FifoBuffer — Identity-Keyed Storage
///
/// The hash map is open-addressed with linear probing over (key, hash, value)
/// entry triples. Deletion leaves tombstones so probe chains stay intact;
/// capacity, occupancy (size) and occupied-count (size + tombstones) are
/// tracked separately and the load factor stays below one.
///
/// Identity hashes of relocated objects can change across a collection, so
/// maps carry a post-migration fixup that rehashes every surviving entry
/// in place once migration has finished.
///
/// The fifo buffer is a fixed-width doubly-linked list threaded through a
/// flat node array with two reserved root nodes, one for the free list and
/// one for the occupied list. Taking preserves the order of what remains.

use crate::core::tagged::{is_nothing, is_null, nothing, null};
use crate::core::value::{Condition, Value};
use crate::heap::{
    get_heap_object_field, heap_object_field_offset, set_heap_object_field, Heap,
};
use crate::objects::{get_array_at, get_array_length, set_array_at};
use crate::runtime::{Roots, Runtime};
use crate::species::{
    self, value_identity_compare, value_transient_identity_hash, Family, PrintContext,
};

// ---------------------------------------------------------------------------
// IdHashMap
// ---------------------------------------------------------------------------

pub const ID_HASH_MAP_SIZE_OFFSET: usize = heap_object_field_offset(0);
pub const ID_HASH_MAP_CAPACITY_OFFSET: usize = heap_object_field_offset(1);
pub const ID_HASH_MAP_OCCUPIED_COUNT_OFFSET: usize = heap_object_field_offset(2);
pub const ID_HASH_MAP_ENTRY_ARRAY_OFFSET: usize = heap_object_field_offset(3);
pub const ID_HASH_MAP_FIELD_COUNT: usize = 4;

pub const ID_HASH_MAP_ENTRY_FIELD_COUNT: usize = 3;
const ENTRY_KEY: usize = 0;
const ENTRY_HASH: usize = 1;
const ENTRY_VALUE: usize = 2;

pub const ID_HASH_MAP_INITIAL_CAPACITY: usize = 16;

pub fn get_id_hash_map_size(map: Value) -> usize {
    get_heap_object_field(map, ID_HASH_MAP_SIZE_OFFSET).as_integer() as usize
}

pub fn set_id_hash_map_size(map: Value, size: usize) {
    set_heap_object_field(map, ID_HASH_MAP_SIZE_OFFSET, Value::new_integer(size as i64));
}

pub fn get_id_hash_map_capacity(map: Value) -> usize {
    get_heap_object_field(map, ID_HASH_MAP_CAPACITY_OFFSET).as_integer() as usize
}

pub fn set_id_hash_map_capacity(map: Value, capacity: usize) {
    set_heap_object_field(map, ID_HASH_MAP_CAPACITY_OFFSET, Value::new_integer(capacity as i64));
}

pub fn get_id_hash_map_occupied_count(map: Value) -> usize {
    get_heap_object_field(map, ID_HASH_MAP_OCCUPIED_COUNT_OFFSET).as_integer() as usize
}

pub fn set_id_hash_map_occupied_count(map: Value, count: usize) {
    set_heap_object_field(
        map,
        ID_HASH_MAP_OCCUPIED_COUNT_OFFSET,
        Value::new_integer(count as i64),
    );
}

pub fn get_id_hash_map_entry_array(map: Value) -> Value {
    get_heap_object_field(map, ID_HASH_MAP_ENTRY_ARRAY_OFFSET)
}

pub fn set_id_hash_map_entry_array(map: Value, array: Value) {
    set_heap_object_field(map, ID_HASH_MAP_ENTRY_ARRAY_OFFSET, array);
}

// ── Entries ──────────────────────────────────────────────────────────────────

fn entry_field(map: Value, index: usize, field: usize) -> Value {
    get_array_at(get_id_hash_map_entry_array(map), index * ID_HASH_MAP_ENTRY_FIELD_COUNT + field)
}

fn set_entry_field(map: Value, index: usize, field: usize, value: Value) {
    crate::objects::set_array_at_raw(
        get_id_hash_map_entry_array(map),
        index * ID_HASH_MAP_ENTRY_FIELD_COUNT + field,
        value,
    );
}

/// A live entry has an integer hash; a tombstone has a null hash; a never
/// used slot has a nothing hash.
fn is_entry_empty(map: Value, index: usize) -> bool {
    is_nothing(entry_field(map, index, ENTRY_HASH))
}

fn is_entry_deleted(map: Value, index: usize) -> bool {
    is_null(entry_field(map, index, ENTRY_HASH))
}

fn is_entry_live(map: Value, index: usize) -> bool {
    entry_field(map, index, ENTRY_HASH).is_integer()
}

/// Truncates a 64-bit identity hash so it stores as a tagged integer.
fn hash_to_value(hash: u64) -> Value {
    Value::new_integer((hash & 0x0fff_ffff_ffff_ffff) as i64)
}

/// Finds the entry for the key. Returns Ok(index) if present; Err(slot)
/// gives the insertion slot (the first tombstone on the probe path if any,
/// else the terminating empty slot), or Err(None) when the probe path never
/// terminates because the map is full.
fn find_entry(map: Value, key: Value, hash: Value) -> Result<usize, Option<usize>> {
    let capacity = get_id_hash_map_capacity(map);
    let start = (hash.as_integer() as u64 % capacity as u64) as usize;
    let mut insert_slot = None;
    for probe in 0..capacity {
        let index = (start + probe) % capacity;
        if is_entry_empty(map, index) {
            return Err(insert_slot.or(Some(index)));
        }
        if is_entry_deleted(map, index) {
            if insert_slot.is_none() {
                insert_slot = Some(index);
            }
            continue;
        }
        if entry_field(map, index, ENTRY_HASH) == hash
            && value_identity_compare(entry_field(map, index, ENTRY_KEY), key)
        {
            return Ok(index);
        }
    }
    Err(insert_slot)
}

/// Sets a mapping without allocating. Fails with MapFull when the insertion
/// would drive the occupied count to capacity; the growing setter handles
/// that by rehashing into a larger entry array.
pub fn try_set_id_hash_map_at(map: Value, key: Value, value: Value) -> Result<(), Condition> {
    let hash = hash_to_value(value_transient_identity_hash(key)?);
    match find_entry(map, key, hash) {
        Ok(index) => {
            set_entry_field(map, index, ENTRY_VALUE, value);
            Ok(())
        }
        Err(slot) => {
            let capacity = get_id_hash_map_capacity(map);
            let occupied = get_id_hash_map_occupied_count(map);
            // Hold one slot back so probe chains always terminate.
            let slot = match slot {
                Some(slot) if occupied + 1 < capacity => slot,
                _ => return Err(Condition::map_full()),
            };
            let was_deleted = is_entry_deleted(map, slot);
            set_entry_field(map, slot, ENTRY_KEY, key);
            set_entry_field(map, slot, ENTRY_HASH, hash);
            set_entry_field(map, slot, ENTRY_VALUE, value);
            set_id_hash_map_size(map, get_id_hash_map_size(map) + 1);
            if !was_deleted {
                set_id_hash_map_occupied_count(map, occupied + 1);
            }
            Ok(())
        }
    }
}

/// Sets a mapping, growing the map when it is full.
pub fn set_id_hash_map_at(
    heap: &mut Heap,
    roots: &Roots,
    map: Value,
    key: Value,
    value: Value,
) -> Result<(), Condition> {
    match try_set_id_hash_map_at(map, key, value) {
        Err(c) if c.cause() == crate::core::value::ConditionCause::MapFull => {
            grow_id_hash_map(heap, roots, map)?;
            try_set_id_hash_map_at(map, key, value)
        }
        other => other,
    }
}

fn grow_id_hash_map(heap: &mut Heap, roots: &Roots, map: Value) -> Result<(), Condition> {
    let old_array = get_id_hash_map_entry_array(map);
    let old_capacity = get_id_hash_map_capacity(map);
    let new_capacity = old_capacity * 2;
    let new_array =
        crate::alloc::new_heap_array(heap, roots, new_capacity * ID_HASH_MAP_ENTRY_FIELD_COUNT)?;
    for i in 0..get_array_length(new_array) {
        set_array_at(new_array, i, nothing());
    }
    // From here on nothing can fail so the map is never left inconsistent.
    set_id_hash_map_entry_array(map, new_array);
    set_id_hash_map_capacity(map, new_capacity);
    set_id_hash_map_size(map, 0);
    set_id_hash_map_occupied_count(map, 0);
    for i in 0..old_capacity {
        let hash = get_array_at(old_array, i * ID_HASH_MAP_ENTRY_FIELD_COUNT + ENTRY_HASH);
        if hash.is_integer() {
            let key = get_array_at(old_array, i * ID_HASH_MAP_ENTRY_FIELD_COUNT + ENTRY_KEY);
            let value = get_array_at(old_array, i * ID_HASH_MAP_ENTRY_FIELD_COUNT + ENTRY_VALUE);
            try_set_id_hash_map_at(map, key, value).expect("rehash into larger map");
        }
    }
    Ok(())
}

/// Looks up a key; NotFound if absent. NotFound is a condition, distinct
/// from a present null value and from the internal nothing sentinel.
pub fn get_id_hash_map_at(map: Value, key: Value) -> Result<Value, Condition> {
    let hash = hash_to_value(value_transient_identity_hash(key)?);
    match find_entry(map, key, hash) {
        Ok(index) => Ok(entry_field(map, index, ENTRY_VALUE)),
        Err(_) => Err(Condition::not_found()),
    }
}

pub fn get_id_hash_map_at_with_default(map: Value, key: Value, fallback: Value) -> Value {
    get_id_hash_map_at(map, key).unwrap_or(fallback)
}

pub fn has_id_hash_map_at(map: Value, key: Value) -> bool {
    get_id_hash_map_at(map, key).is_ok()
}

/// Removes a mapping, leaving a tombstone. NotFound if absent.
pub fn delete_id_hash_map_at(map: Value, key: Value) -> Result<(), Condition> {
    let hash = hash_to_value(value_transient_identity_hash(key)?);
    match find_entry(map, key, hash) {
        Ok(index) => {
            set_entry_field(map, index, ENTRY_KEY, nothing());
            set_entry_field(map, index, ENTRY_HASH, null());
            set_entry_field(map, index, ENTRY_VALUE, null());
            set_id_hash_map_size(map, get_id_hash_map_size(map) - 1);
            Ok(())
        }
        Err(_) => Err(Condition::not_found()),
    }
}

// ── Iteration ────────────────────────────────────────────────────────────────

/// Walks the live entries of a map. The traversal order is an artifact of
/// the probe layout and must not be surfaced to the language.
pub struct IdHashMapIter {
    map: Value,
    cursor: usize,
}

impl IdHashMapIter {
    pub fn new(map: Value) -> IdHashMapIter {
        IdHashMapIter { map, cursor: 0 }
    }
}

impl Iterator for IdHashMapIter {
    type Item = (Value, Value);

    fn next(&mut self) -> Option<(Value, Value)> {
        let capacity = get_id_hash_map_capacity(self.map);
        while self.cursor < capacity {
            let index = self.cursor;
            self.cursor += 1;
            if is_entry_live(self.map, index) {
                return Some((
                    entry_field(self.map, index, ENTRY_KEY),
                    entry_field(self.map, index, ENTRY_VALUE),
                ));
            }
        }
        None
    }
}

// ── Behavior hooks ───────────────────────────────────────────────────────────

pub fn id_hash_map_validate(map: Value) -> Result<(), Condition> {
    let entries = get_id_hash_map_entry_array(map);
    if !species::in_family(Family::Array, entries) {
        return Err(Condition::validation_failed());
    }
    let capacity = get_id_hash_map_capacity(map);
    if get_array_length(entries) != capacity * ID_HASH_MAP_ENTRY_FIELD_COUNT {
        return Err(Condition::validation_failed());
    }
    if get_id_hash_map_size(map) > get_id_hash_map_occupied_count(map) {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

pub fn id_hash_map_print_on(map: Value, context: &mut PrintContext) {
    context.buf.push('{');
    context.depth += 1;
    let mut first = true;
    for (key, value) in IdHashMapIter::new(map) {
        if !first {
            context.buf.push_str(", ");
        }
        first = false;
        species::value_print_on(key, context);
        context.buf.push_str(": ");
        species::value_print_on(value, context);
    }
    context.depth -= 1;
    context.buf.push('}');
}

pub fn ensure_id_hash_map_owned_values_frozen(
    runtime: &mut Runtime,
    map: Value,
) -> Result<(), Condition> {
    species::ensure_frozen(runtime, get_id_hash_map_entry_array(map))
}

/// Rehashes the map in place after migration; entries whose keys moved have
/// new identity hashes so their probe positions are stale. Runs after the
/// whole migration pass, when every entry holds final to-space values.
pub fn fixup_id_hash_map_post_migrate(map: Value) {
    let capacity = get_id_hash_map_capacity(map);
    let mut live = Vec::with_capacity(get_id_hash_map_size(map));
    for i in 0..capacity {
        if is_entry_live(map, i) {
            live.push((entry_field(map, i, ENTRY_KEY), entry_field(map, i, ENTRY_VALUE)));
        }
        set_entry_field(map, i, ENTRY_KEY, nothing());
        set_entry_field(map, i, ENTRY_HASH, nothing());
        set_entry_field(map, i, ENTRY_VALUE, nothing());
    }
    set_id_hash_map_size(map, 0);
    set_id_hash_map_occupied_count(map, 0);
    for (key, value) in live {
        try_set_id_hash_map_at(map, key, value).expect("post-gc rehash");
    }
}

// ---------------------------------------------------------------------------
// FifoBuffer
// ---------------------------------------------------------------------------

pub const FIFO_BUFFER_NODES_OFFSET: usize = heap_object_field_offset(0);
pub const FIFO_BUFFER_SIZE_OFFSET: usize = heap_object_field_offset(1);
pub const FIFO_BUFFER_WIDTH_OFFSET: usize = heap_object_field_offset(2);
pub const FIFO_BUFFER_FIELD_COUNT: usize = 3;

/// Each node is [next, prev, values × width].
pub const FIFO_BUFFER_NODE_HEADER_SIZE: usize = 2;
/// Index of the free-list root node.
pub const FIFO_BUFFER_FREE_ROOT: usize = 0;
/// Index of the occupied-list root node.
pub const FIFO_BUFFER_OCCUPIED_ROOT: usize = 1;
pub const FIFO_BUFFER_RESERVED_NODE_COUNT: usize = 2;

pub fn get_fifo_buffer_nodes(buffer: Value) -> Value {
    get_heap_object_field(buffer, FIFO_BUFFER_NODES_OFFSET)
}

pub fn set_fifo_buffer_nodes(buffer: Value, nodes: Value) {
    set_heap_object_field(buffer, FIFO_BUFFER_NODES_OFFSET, nodes);
}

pub fn get_fifo_buffer_size(buffer: Value) -> usize {
    get_heap_object_field(buffer, FIFO_BUFFER_SIZE_OFFSET).as_integer() as usize
}

pub fn set_fifo_buffer_size(buffer: Value, size: usize) {
    set_heap_object_field(buffer, FIFO_BUFFER_SIZE_OFFSET, Value::new_integer(size as i64));
}

pub fn get_fifo_buffer_width(buffer: Value) -> usize {
    get_heap_object_field(buffer, FIFO_BUFFER_WIDTH_OFFSET).as_integer() as usize
}

pub fn set_fifo_buffer_width(buffer: Value, width: usize) {
    set_heap_object_field(buffer, FIFO_BUFFER_WIDTH_OFFSET, Value::new_integer(width as i64));
}

pub const fn fifo_buffer_node_length(width: usize) -> usize {
    width + FIFO_BUFFER_NODE_HEADER_SIZE
}

/// Length of the node array backing a buffer of the given width/capacity.
pub const fn fifo_buffer_nodes_length(width: usize, capacity: usize) -> usize {
    fifo_buffer_node_length(width) * (capacity + FIFO_BUFFER_RESERVED_NODE_COUNT)
}

pub fn get_fifo_buffer_capacity(buffer: Value) -> usize {
    let nodes = get_fifo_buffer_nodes(buffer);
    get_array_length(nodes) / fifo_buffer_node_length(get_fifo_buffer_width(buffer))
        - FIFO_BUFFER_RESERVED_NODE_COUNT
}

fn node_next(buffer: Value, index: usize) -> usize {
    let node_length = fifo_buffer_node_length(get_fifo_buffer_width(buffer));
    get_array_at(get_fifo_buffer_nodes(buffer), index * node_length).as_integer() as usize
}

fn set_node_next(buffer: Value, index: usize, next: usize) {
    let node_length = fifo_buffer_node_length(get_fifo_buffer_width(buffer));
    set_array_at(
        get_fifo_buffer_nodes(buffer),
        index * node_length,
        Value::new_integer(next as i64),
    );
}

fn node_prev(buffer: Value, index: usize) -> usize {
    let node_length = fifo_buffer_node_length(get_fifo_buffer_width(buffer));
    get_array_at(get_fifo_buffer_nodes(buffer), index * node_length + 1).as_integer() as usize
}

fn set_node_prev(buffer: Value, index: usize, prev: usize) {
    let node_length = fifo_buffer_node_length(get_fifo_buffer_width(buffer));
    set_array_at(
        get_fifo_buffer_nodes(buffer),
        index * node_length + 1,
        Value::new_integer(prev as i64),
    );
}

fn get_node_values(buffer: Value, index: usize, values_out: &mut [Value]) {
    let width = get_fifo_buffer_width(buffer);
    debug_assert_eq!(values_out.len(), width);
    let node_length = fifo_buffer_node_length(width);
    let nodes = get_fifo_buffer_nodes(buffer);
    for (i, slot) in values_out.iter_mut().enumerate() {
        *slot = get_array_at(nodes, index * node_length + FIFO_BUFFER_NODE_HEADER_SIZE + i);
    }
}

fn set_node_values(buffer: Value, index: usize, values: &[Value]) {
    let width = get_fifo_buffer_width(buffer);
    debug_assert_eq!(values.len(), width);
    let node_length = fifo_buffer_node_length(width);
    let nodes = get_fifo_buffer_nodes(buffer);
    for (i, &value) in values.iter().enumerate() {
        set_array_at(nodes, index * node_length + FIFO_BUFFER_NODE_HEADER_SIZE + i, value);
    }
}

fn clear_node_values(buffer: Value, index: usize) {
    let width = get_fifo_buffer_width(buffer);
    let node_length = fifo_buffer_node_length(width);
    let nodes = get_fifo_buffer_nodes(buffer);
    for i in 0..width {
        set_array_at(nodes, index * node_length + FIFO_BUFFER_NODE_HEADER_SIZE + i, nothing());
    }
}

fn unhook_node(buffer: Value, index: usize) {
    let prev = node_prev(buffer, index);
    let next = node_next(buffer, index);
    set_node_next(buffer, prev, next);
    set_node_prev(buffer, next, prev);
}

/// Inserts `target` at the tail of the list rooted at `root`.
fn hook_node_at_tail(buffer: Value, root: usize, target: usize) {
    let tail = node_prev(buffer, root);
    set_node_next(buffer, target, root);
    set_node_prev(buffer, target, tail);
    set_node_next(buffer, tail, target);
    set_node_prev(buffer, root, target);
}

/// Wires a fresh node array: both roots self-linked, all data nodes on the
/// free list. Called by the allocator and when growing.
pub fn init_fifo_buffer_links(buffer: Value) {
    let capacity = get_fifo_buffer_capacity(buffer);
    set_node_next(buffer, FIFO_BUFFER_FREE_ROOT, FIFO_BUFFER_FREE_ROOT);
    set_node_prev(buffer, FIFO_BUFFER_FREE_ROOT, FIFO_BUFFER_FREE_ROOT);
    set_node_next(buffer, FIFO_BUFFER_OCCUPIED_ROOT, FIFO_BUFFER_OCCUPIED_ROOT);
    set_node_prev(buffer, FIFO_BUFFER_OCCUPIED_ROOT, FIFO_BUFFER_OCCUPIED_ROOT);
    for i in 0..capacity {
        let node = FIFO_BUFFER_RESERVED_NODE_COUNT + i;
        clear_node_values(buffer, node);
        hook_node_at_tail(buffer, FIFO_BUFFER_FREE_ROOT, node);
    }
}

/// Appends an entry. Returns false when the buffer is at capacity.
pub fn try_offer_to_fifo_buffer(buffer: Value, values: &[Value]) -> bool {
    if get_fifo_buffer_size(buffer) == get_fifo_buffer_capacity(buffer) {
        return false;
    }
    let node = node_next(buffer, FIFO_BUFFER_FREE_ROOT);
    debug_assert_ne!(node, FIFO_BUFFER_FREE_ROOT);
    unhook_node(buffer, node);
    hook_node_at_tail(buffer, FIFO_BUFFER_OCCUPIED_ROOT, node);
    set_node_values(buffer, node, values);
    set_fifo_buffer_size(buffer, get_fifo_buffer_size(buffer) + 1);
    true
}

/// Appends an entry, growing the node array when full.
pub fn offer_to_fifo_buffer(
    heap: &mut Heap,
    roots: &Roots,
    buffer: Value,
    values: &[Value],
) -> Result<(), Condition> {
    if try_offer_to_fifo_buffer(buffer, values) {
        return Ok(());
    }
    grow_fifo_buffer(heap, roots, buffer)?;
    let pushed = try_offer_to_fifo_buffer(buffer, values);
    debug_assert!(pushed);
    Ok(())
}

fn grow_fifo_buffer(heap: &mut Heap, roots: &Roots, buffer: Value) -> Result<(), Condition> {
    let width = get_fifo_buffer_width(buffer);
    let old_capacity = get_fifo_buffer_capacity(buffer);
    let new_capacity = if old_capacity == 0 { 4 } else { old_capacity * 2 };
    // Allocate up front; a failed allocation must leave the buffer intact.
    let new_nodes =
        crate::alloc::new_heap_array(heap, roots, fifo_buffer_nodes_length(width, new_capacity))?;
    let size = get_fifo_buffer_size(buffer);
    let mut drained = Vec::with_capacity(size);
    let mut values = vec![nothing(); width];
    while take_from_fifo_buffer(buffer, &mut values).is_ok() {
        drained.push(values.clone());
    }
    set_fifo_buffer_nodes(buffer, new_nodes);
    set_fifo_buffer_size(buffer, 0);
    init_fifo_buffer_links(buffer);
    for entry in drained {
        let pushed = try_offer_to_fifo_buffer(buffer, &entry);
        debug_assert!(pushed);
    }
    Ok(())
}

/// Takes the oldest entry. NotFound when empty.
pub fn take_from_fifo_buffer(buffer: Value, values_out: &mut [Value]) -> Result<(), Condition> {
    let head = node_next(buffer, FIFO_BUFFER_OCCUPIED_ROOT);
    if head == FIFO_BUFFER_OCCUPIED_ROOT {
        return Err(Condition::not_found());
    }
    get_node_values(buffer, head, values_out);
    unhook_node(buffer, head);
    clear_node_values(buffer, head);
    hook_node_at_tail(buffer, FIFO_BUFFER_FREE_ROOT, head);
    set_fifo_buffer_size(buffer, get_fifo_buffer_size(buffer) - 1);
    Ok(())
}

pub fn fifo_buffer_validate(buffer: Value) -> Result<(), Condition> {
    if !species::in_family(Family::Array, get_fifo_buffer_nodes(buffer)) {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

/// In-order iteration over the occupied list. `take_current` removes the
/// entry just returned without disturbing the order of the rest.
pub struct FifoBufferIter {
    buffer: Value,
    current: usize,
}

impl FifoBufferIter {
    pub fn new(buffer: Value) -> FifoBufferIter {
        FifoBufferIter { buffer, current: FIFO_BUFFER_OCCUPIED_ROOT }
    }

    pub fn advance(&mut self, values_out: &mut [Value]) -> bool {
        let next = node_next(self.buffer, self.current);
        if next == FIFO_BUFFER_OCCUPIED_ROOT {
            return false;
        }
        self.current = next;
        get_node_values(self.buffer, next, values_out);
        true
    }

    /// Removes the entry the iterator is at; the iterator stays valid and
    /// keeps walking the remaining entries in order.
    pub fn take_current(&mut self) {
        debug_assert_ne!(self.current, FIFO_BUFFER_OCCUPIED_ROOT);
        let taken = self.current;
        self.current = node_prev(self.buffer, taken);
        unhook_node(self.buffer, taken);
        clear_node_values(self.buffer, taken);
        hook_node_at_tail(self.buffer, FIFO_BUFFER_FREE_ROOT, taken);
        set_fifo_buffer_size(self.buffer, get_fifo_buffer_size(self.buffer) - 1);
    }
}
