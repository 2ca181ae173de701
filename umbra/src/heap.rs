/// Heap — Semispace Memory Management
///
/// ARCHITECTURE
/// ────────────
/// • Two spaces; allocation bumps a cursor in to-space, from-space is empty
///   except while a collection is running
/// • Allocation never blocks and never collects: exhaustion surfaces as a
///   HeapExhausted condition and the interpreter's outer loop retries after
///   a collection
/// • Object trackers: a sentinel-rooted doubly-linked ring of handles that
///   keep values alive (or weakly observe them) across collections
/// • Zapping: fresh, allocated and freed memory are overwritten with marker
///   values so stale reads are recognizably wrong
/// • Fuzzing: with gc_fuzz_freq > 0 the allocator simulates failures at
///   pseudo-random intervals to shake out missing retry paths
///
/// All object field access goes through the raw-address helpers at the bottom
/// of this module. No Rust reference into heap memory is ever held across an
/// allocation, which is what makes the moving collector sound.

use std::alloc::{alloc, dealloc, Layout};

use crate::core::tagged::{
    new_allocated_memory, new_freed_memory, new_unused_memory,
};
use crate::core::value::{Condition, ConditionCause, Value, VALUE_SIZE};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings to apply when creating a runtime.
#[derive(Clone)]
pub struct RuntimeConfig {
    /// The size in bytes of each semispace.
    pub semispace_size_bytes: usize,
    /// The max amount of memory allocated from the system; a failsafe in case
    /// a bug causes the runtime to allocate out of control.
    pub system_memory_limit: usize,
    /// How often, on average, to simulate an allocation failure when fuzzing.
    /// Zero disables fuzzing.
    pub gc_fuzz_freq: usize,
    /// Seed for the fuzzer's pseudo-random generator.
    pub gc_fuzz_seed: u64,
    /// Seed for the runtime's own pseudo-random generator (identity hashing).
    pub random_seed: u64,
    /// Native object layouts to install species for at startup.
    pub plugins: Vec<crate::species::CObjectInfo>,
    /// Access to the file system; None means the native one.
    pub file_system: Option<std::sync::Arc<dyn crate::io::FileSystem>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            semispace_size_bytes: 2 * 1024 * 1024,
            system_memory_limit: 128 * 1024 * 1024,
            gc_fuzz_freq: 0,
            gc_fuzz_seed: 0x5ca1e,
            random_seed: 0x5eed,
            plugins: Vec::new(),
            file_system: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Space
// ---------------------------------------------------------------------------

/// One allocation space. The heap is made up of two of these.
pub struct Space {
    /// Raw backing memory; null for the empty space.
    memory: *mut u8,
    /// Total byte size of the backing memory.
    memory_size: usize,
    /// Address of the first object in this space.
    start: usize,
    /// Next free address; always value aligned.
    next_free: usize,
    /// First address past the end.
    limit: usize,
}

// The space is only ever touched from the interpreter thread; the raw pointer
// just defeats the auto traits.
unsafe impl Send for Space {}

impl Space {
    /// An empty space: every query returns false, every allocation fails.
    pub fn empty() -> Space {
        Space { memory: std::ptr::null_mut(), memory_size: 0, start: 0, next_free: 0, limit: 0 }
    }

    pub fn new(size_bytes: usize) -> Result<Space, Condition> {
        let size = align_size(VALUE_SIZE, size_bytes);
        let layout = Layout::from_size_align(size, VALUE_SIZE)
            .map_err(|_| Condition::new(ConditionCause::OutOfMemory))?;
        let memory = unsafe { alloc(layout) };
        if memory.is_null() {
            return Err(Condition::new(ConditionCause::OutOfMemory));
        }
        let start = memory as usize;
        let space = Space {
            memory,
            memory_size: size,
            start,
            next_free: start,
            limit: start + size,
        };
        space.zap(start, size, ZapKind::Unused);
        Ok(space)
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_null()
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn next_free(&self) -> usize {
        self.next_free
    }

    pub fn contains(&self, addr: usize) -> bool {
        !self.is_empty() && self.start <= addr && addr < self.limit
    }

    /// Allocates `size` bytes, rounding up to value alignment. Returns the
    /// address on success, None when the space is full.
    pub fn try_alloc(&mut self, size: usize) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let aligned = align_size(VALUE_SIZE, size);
        if self.next_free + aligned > self.limit {
            return None;
        }
        let addr = self.next_free;
        self.next_free += aligned;
        self.zap(addr, aligned, ZapKind::Allocated);
        Some(addr)
    }

    fn zap(&self, addr: usize, size: usize, kind: ZapKind) {
        let words = size / VALUE_SIZE;
        for i in 0..words {
            let marker = match kind {
                ZapKind::Unused    => new_unused_memory(i),
                ZapKind::Allocated => new_allocated_memory(i),
                ZapKind::Freed     => new_freed_memory(i),
            };
            unsafe { *((addr + i * VALUE_SIZE) as *mut u64) = marker.raw() };
        }
    }

    /// Releases the backing memory, zapping it first.
    pub fn dispose(&mut self) {
        if self.is_empty() {
            return;
        }
        self.zap(self.start, self.memory_size, ZapKind::Freed);
        let layout = Layout::from_size_align(self.memory_size, VALUE_SIZE).unwrap();
        unsafe { dealloc(self.memory, layout) };
        *self = Space::empty();
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[derive(Clone, Copy)]
enum ZapKind {
    Unused,
    Allocated,
    Freed,
}

/// Rounds `size` up to an `alignment` boundary.
pub fn align_size(alignment: usize, size: usize) -> usize {
    (size + alignment - 1) & !(alignment - 1)
}

// ---------------------------------------------------------------------------
// Object trackers
// ---------------------------------------------------------------------------

/// Flags on an object tracker.
pub mod tracker_flags {
    /// The tracker never keeps its value alive; it observes whether the value
    /// survived for other reasons.
    pub const ALWAYS_WEAK: u64 = 0x1;
    /// When the value dies the tracker unlinks and frees itself.
    pub const SELF_DESTRUCT: u64 = 0x2;
    /// When the value dies the finalizer callback runs; used to release
    /// native resources such as pipes.
    pub const FINALIZE: u64 = 0x4;
}

/// A node in the tracker ring. Nodes are individually boxed; the ring is
/// threaded through raw pointers with a sentinel owned by the heap.
pub struct ObjectTracker {
    pub value: Value,
    pub flags: u64,
    pub finalizer: Option<Box<dyn FnMut() + Send>>,
    prev: *mut ObjectTracker,
    next: *mut ObjectTracker,
}

/// A handle that keeps a heap value reachable across collections. Deref after
/// a collection yields the migrated value. This is the only safe way to hold
/// onto heap references across allocation boundaries in native code.
#[derive(Clone, Copy)]
pub struct SafeValue(*mut ObjectTracker);

unsafe impl Send for SafeValue {}

impl SafeValue {
    #[inline]
    pub fn deref(self) -> Value {
        unsafe { (*self.0).value }
    }

    pub(crate) fn node(self) -> *mut ObjectTracker {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

/// A full garbage-collectable heap.
pub struct Heap {
    pub config: RuntimeConfig,
    /// The space where new objects are allocated.
    pub to_space: Space,
    /// During gc, holds existing objects from which values are copied into
    /// to-space. Empty otherwise.
    pub from_space: Space,
    /// Sentinel of the tracker ring.
    root_tracker: *mut ObjectTracker,
    tracker_count: usize,
    fuzzer: Option<AllocFuzzer>,
}

unsafe impl Send for Heap {}

impl Heap {
    pub fn new(config: RuntimeConfig) -> Result<Heap, Condition> {
        if config.semispace_size_bytes * 2 > config.system_memory_limit {
            return Err(Condition::new(ConditionCause::OutOfMemory));
        }
        let to_space = Space::new(config.semispace_size_bytes)?;
        let sentinel = Box::into_raw(Box::new(ObjectTracker {
            value: crate::core::tagged::nothing(),
            flags: 0,
            finalizer: None,
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
        }));
        unsafe {
            (*sentinel).prev = sentinel;
            (*sentinel).next = sentinel;
        }
        Ok(Heap {
            config,
            to_space,
            from_space: Space::empty(),
            root_tracker: sentinel,
            tracker_count: 0,
            fuzzer: None,
        })
    }

    /// Arms the allocation fuzzer per the config. Called once bootstrap
    /// allocation is done; failing the roots would leave nothing to retry.
    pub fn enable_fuzzing(&mut self) {
        if self.config.gc_fuzz_freq > 0 {
            self.fuzzer = Some(AllocFuzzer::new(
                self.config.gc_fuzz_freq,
                self.config.gc_fuzz_seed,
            ));
        }
    }

    /// Allocates raw object memory in to-space. Exhaustion (or a simulated
    /// fuzz failure) returns a HeapExhausted condition that the caller must
    /// propagate out to the collection retry loop.
    pub fn try_alloc(&mut self, size: usize) -> Result<usize, Condition> {
        if let Some(fuzzer) = self.fuzzer.as_mut() {
            if fuzzer.should_fail() {
                return Err(Condition::heap_exhausted(size));
            }
        }
        self.to_space
            .try_alloc(size)
            .ok_or_else(|| Condition::heap_exhausted(size))
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.to_space.contains(addr)
    }

    /// Swaps the spaces at the start of a collection; allocation proceeds
    /// from a fresh to-space afterwards.
    pub fn prepare_gc(&mut self) -> Result<(), Condition> {
        debug_assert!(self.from_space.is_empty(), "gc already in progress");
        let fresh = Space::new(self.config.semispace_size_bytes)?;
        self.from_space = std::mem::replace(&mut self.to_space, fresh);
        Ok(())
    }

    /// Frees the old from-space at the end of a collection.
    pub fn complete_gc(&mut self) {
        self.from_space.dispose();
        if let Some(fuzzer) = self.fuzzer.as_mut() {
            // A collection has happened so the next simulated failure should
            // not strike the retry of the allocation that triggered it.
            fuzzer.reschedule();
        }
    }

    // ── Trackers ─────────────────────────────────────────────────────────────

    pub fn new_tracker(
        &mut self,
        value: Value,
        flags: u64,
        finalizer: Option<Box<dyn FnMut() + Send>>,
    ) -> SafeValue {
        let node = Box::into_raw(Box::new(ObjectTracker {
            value,
            flags,
            finalizer,
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
        }));
        unsafe {
            let head = self.root_tracker;
            (*node).next = (*head).next;
            (*node).prev = head;
            (*(*head).next).prev = node;
            (*head).next = node;
        }
        self.tracker_count += 1;
        SafeValue(node)
    }

    pub fn dispose_tracker(&mut self, handle: SafeValue) {
        let node = handle.0;
        debug_assert!(node != self.root_tracker);
        unsafe {
            (*(*node).prev).next = (*node).next;
            (*(*node).next).prev = (*node).prev;
            drop(Box::from_raw(node));
        }
        self.tracker_count -= 1;
    }

    pub fn tracker_count(&self) -> usize {
        self.tracker_count
    }

    /// Visits every tracker node. The callback may not allocate trackers.
    pub fn for_each_tracker(&mut self, mut callback: impl FnMut(&mut ObjectTracker)) {
        unsafe {
            let mut cursor = (*self.root_tracker).next;
            while cursor != self.root_tracker {
                let next = (*cursor).next;
                callback(&mut *cursor);
                cursor = next;
            }
        }
    }

    /// Unlinks and frees the tracker nodes the callback selects, running
    /// their finalizers first. Used for self-destruct trackers after gc.
    pub fn reap_trackers(&mut self, mut should_reap: impl FnMut(&ObjectTracker) -> bool) {
        unsafe {
            let mut cursor = (*self.root_tracker).next;
            while cursor != self.root_tracker {
                let next = (*cursor).next;
                if should_reap(&*cursor) {
                    if let Some(finalizer) = (*cursor).finalizer.as_mut() {
                        finalizer();
                    }
                    (*(*cursor).prev).next = (*cursor).next;
                    (*(*cursor).next).prev = (*cursor).prev;
                    drop(Box::from_raw(cursor));
                    self.tracker_count -= 1;
                }
                cursor = next;
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe {
            let mut cursor = (*self.root_tracker).next;
            while cursor != self.root_tracker {
                let next = (*cursor).next;
                if let Some(finalizer) = (*cursor).finalizer.as_mut() {
                    finalizer();
                }
                drop(Box::from_raw(cursor));
                cursor = next;
            }
            drop(Box::from_raw(self.root_tracker));
        }
    }
}

// ---------------------------------------------------------------------------
// Allocation fuzzer
// ---------------------------------------------------------------------------

/// Simulates allocation failures at pseudo-random intervals averaging the
/// configured frequency. Failure intervals are drawn from [1, 2·freq] so
/// every allocation site that runs often enough gets failed eventually.
struct AllocFuzzer {
    freq: u64,
    state: u64,
    remaining: u64,
    /// Set after a failure; the next allocation always succeeds so retry
    /// chains cannot fail forever.
    cooling_down: bool,
}

impl AllocFuzzer {
    fn new(freq: usize, seed: u64) -> AllocFuzzer {
        let mut fuzzer = AllocFuzzer {
            freq: freq as u64,
            state: seed | 1,
            remaining: 0,
            cooling_down: false,
        };
        fuzzer.reschedule();
        fuzzer
    }

    fn next_random(&mut self) -> u64 {
        // xorshift64; quality only needs to be good enough to spread failure
        // points across call sites.
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn reschedule(&mut self) {
        let draw = self.next_random() % (2 * self.freq) + 1;
        self.remaining = draw;
        self.cooling_down = false;
    }

    fn should_fail(&mut self) -> bool {
        if self.cooling_down {
            self.cooling_down = false;
            return false;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.reschedule();
            self.cooling_down = true;
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Raw object access
// ---------------------------------------------------------------------------

/// Size in bytes of an object header.
pub const HEAP_OBJECT_HEADER_SIZE: usize = VALUE_SIZE;

/// Size in bytes of an object with `n` fields, header not counted as a field.
pub const fn heap_object_size(n: usize) -> usize {
    n * VALUE_SIZE + HEAP_OBJECT_HEADER_SIZE
}

/// Byte offset of the n'th field, starting from 0 past the header.
pub const fn heap_object_field_offset(n: usize) -> usize {
    n * VALUE_SIZE + HEAP_OBJECT_HEADER_SIZE
}

/// Describes an object's size and where its value fields start. Everything
/// from `value_offset` to `size` is a value the gc may move; everything
/// before is raw data it copies untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapObjectLayout {
    pub size: usize,
    pub value_offset: usize,
}

impl HeapObjectLayout {
    pub fn new(size: usize, value_offset: usize) -> HeapObjectLayout {
        HeapObjectLayout { size, value_offset }
    }
}

#[inline]
pub fn read_word(addr: usize) -> u64 {
    unsafe { *(addr as *const u64) }
}

#[inline]
pub fn write_word(addr: usize, word: u64) {
    unsafe { *(addr as *mut u64) = word }
}

/// Reads the field at the given byte offset of a heap object.
#[inline]
pub fn get_heap_object_field(obj: Value, offset: usize) -> Value {
    Value::from_raw(read_word(obj.heap_object_address() + offset))
}

/// Writes the field at the given byte offset of a heap object.
#[inline]
pub fn set_heap_object_field(obj: Value, offset: usize, value: Value) {
    write_word(obj.heap_object_address() + offset, value.raw())
}

/// The header word: the species during normal execution, possibly a moved
/// object forward during gc.
#[inline]
pub fn get_heap_object_header(obj: Value) -> Value {
    Value::from_raw(read_word(obj.heap_object_address()))
}

#[inline]
pub fn set_heap_object_header(obj: Value, header: Value) {
    write_word(obj.heap_object_address(), header.raw());
}

/// Pointer to non-value data at a byte offset within a heap object.
#[inline]
pub fn heap_object_data_ptr(obj: Value, offset: usize) -> *mut u8 {
    (obj.heap_object_address() + offset) as *mut u8
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tagged::{is_nothing, nothing};

    #[test]
    fn test_space_alloc_aligns_and_bumps() {
        let mut space = Space::new(4096).unwrap();
        let a = space.try_alloc(12).unwrap();
        let b = space.try_alloc(8).unwrap();
        assert_eq!(a % VALUE_SIZE, 0);
        assert_eq!(b, a + 16);
    }

    #[test]
    fn test_space_exhaustion() {
        let mut space = Space::new(64).unwrap();
        assert!(space.try_alloc(48).is_some());
        assert!(space.try_alloc(32).is_none());
    }

    #[test]
    fn test_fresh_memory_is_zapped() {
        let mut space = Space::new(256).unwrap();
        let addr = space.try_alloc(16).unwrap();
        let marker = Value::from_raw(read_word(addr));
        assert!(crate::core::tagged::in_phylum(
            crate::core::tagged::Phylum::AllocatedMemory,
            marker
        ));
    }

    #[test]
    fn test_heap_alloc_and_exhaustion_condition() {
        let config = RuntimeConfig { semispace_size_bytes: 128, ..Default::default() };
        let mut heap = Heap::new(config).unwrap();
        assert!(heap.try_alloc(64).is_ok());
        let err = heap.try_alloc(128).unwrap_err();
        assert_eq!(err.cause(), crate::core::value::ConditionCause::HeapExhausted);
    }

    #[test]
    fn test_tracker_ring() {
        let mut heap = Heap::new(RuntimeConfig::default()).unwrap();
        let a = heap.new_tracker(Value::new_integer(1), 0, None);
        let b = heap.new_tracker(Value::new_integer(2), tracker_flags::ALWAYS_WEAK, None);
        assert_eq!(heap.tracker_count(), 2);
        assert_eq!(a.deref().as_integer(), 1);
        let mut seen = Vec::new();
        heap.for_each_tracker(|t| seen.push(t.value));
        assert_eq!(seen.len(), 2);
        heap.dispose_tracker(b);
        assert_eq!(heap.tracker_count(), 1);
        heap.dispose_tracker(a);
        assert_eq!(heap.tracker_count(), 0);
    }

    #[test]
    fn test_reap_runs_finalizer() {
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = fired.clone();
        let mut heap = Heap::new(RuntimeConfig::default()).unwrap();
        heap.new_tracker(
            nothing(),
            tracker_flags::SELF_DESTRUCT | tracker_flags::FINALIZE,
            Some(Box::new(move || {
                fired_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            })),
        );
        heap.reap_trackers(|t| is_nothing(t.value));
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(heap.tracker_count(), 0);
    }

    #[test]
    fn test_fuzzer_fails_roughly_at_frequency() {
        let mut fuzzer = AllocFuzzer::new(16, 99);
        let mut failures = 0;
        for _ in 0..16_000 {
            if fuzzer.should_fail() {
                failures += 1;
            }
        }
        assert!(failures > 400 && failures < 2200, "failures = {}", failures);
    }

    #[test]
    fn test_fuzzer_cools_down_after_failure() {
        let mut fuzzer = AllocFuzzer::new(2, 7);
        for _ in 0..1000 {
            if fuzzer.should_fail() {
                assert!(!fuzzer.should_fail());
            }
        }
    }
}
