/// Processes, Tasks and the Airlock
///
/// A process owns a work queue of jobs, a root task with its own stack, a
/// hash source for identity hashes, and an _airlock_: the producer/consumer
/// buffer through which the I/O engine hands completed operations back to
/// the interpreter thread. The buffer sits behind the runtime's one mutex;
/// two semaphores meter vacancies and availability.
///
/// Jobs run to completion, one at a time; a job whose guard promise is
/// unresolved stays queued, and fulfillments delivered through the airlock
/// only become observable at the next job boundary.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::tagged::{is_nothing, nothing};
use crate::core::value::{Condition, Value};
use crate::heap::{heap_object_field_offset, get_heap_object_field, set_heap_object_field, SafeValue};
use crate::instance::{fulfill_promise, is_promise_settled, reject_promise};
use crate::maps::{offer_to_fifo_buffer, FifoBufferIter};
use crate::runtime::Runtime;
use crate::sync::Semaphore;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

pub const TASK_PROCESS_OFFSET: usize = heap_object_field_offset(0);
pub const TASK_STACK_OFFSET: usize = heap_object_field_offset(1);
pub const TASK_FIELD_COUNT: usize = 2;

pub fn get_task_process(task: Value) -> Value {
    get_heap_object_field(task, TASK_PROCESS_OFFSET)
}

pub fn get_task_stack(task: Value) -> Value {
    get_heap_object_field(task, TASK_STACK_OFFSET)
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

pub const PROCESS_WORK_QUEUE_OFFSET: usize = heap_object_field_offset(0);
pub const PROCESS_ROOT_TASK_OFFSET: usize = heap_object_field_offset(1);
pub const PROCESS_HASH_SOURCE_OFFSET: usize = heap_object_field_offset(2);
pub const PROCESS_AIRLOCK_PTR_OFFSET: usize = heap_object_field_offset(3);
pub const PROCESS_FIELD_COUNT: usize = 4;

/// Values per work queue entry: code, data, promise, guard.
pub const PROCESS_WORK_QUEUE_WIDTH: usize = 4;

pub fn get_process_work_queue(process: Value) -> Value {
    get_heap_object_field(process, PROCESS_WORK_QUEUE_OFFSET)
}

pub fn get_process_root_task(process: Value) -> Value {
    get_heap_object_field(process, PROCESS_ROOT_TASK_OFFSET)
}

pub fn get_process_hash_source(process: Value) -> Value {
    get_heap_object_field(process, PROCESS_HASH_SOURCE_OFFSET)
}

pub fn get_process_airlock_ptr(process: Value) -> Value {
    get_heap_object_field(process, PROCESS_AIRLOCK_PTR_OFFSET)
}

/// The native airlock behind the process's VoidP. The Arc in the VoidP is
/// owned by the process and released by its finalizer.
pub fn get_process_airlock(process: Value) -> Arc<Airlock> {
    let raw = crate::objects::get_void_p_value(get_process_airlock_ptr(process));
    let arc = unsafe { Arc::from_raw(raw as *const Airlock) };
    let clone = arc.clone();
    std::mem::forget(arc);
    clone
}

/// One unit of work: run `code` with `data` on the stack, fulfilling the
/// promise (if any) with the result. A job with a guard promise only runs
/// once the guard resolves.
pub struct Job {
    pub code: Value,
    pub data: Value,
    pub promise: Value,
    pub guard: Value,
}

pub fn offer_process_job(runtime: &mut Runtime, process: Value, job: &Job) -> Result<(), Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let work_queue = get_process_work_queue(process);
    offer_to_fifo_buffer(
        heap,
        roots,
        work_queue,
        &[job.code, job.data, job.promise, job.guard],
    )
}

/// Scans the queue for the first job whose guard is resolved (or absent),
/// dequeues and returns it. NotFound when nothing is runnable.
pub fn take_process_job(process: Value) -> Result<Job, Condition> {
    let mut iter = FifoBufferIter::new(get_process_work_queue(process));
    let mut values = [nothing(); PROCESS_WORK_QUEUE_WIDTH];
    while iter.advance(&mut values) {
        let job = Job { code: values[0], data: values[1], promise: values[2], guard: values[3] };
        if is_nothing(job.guard) || is_promise_settled(job.guard) {
            iter.take_current();
            return Ok(job);
        }
    }
    Err(Condition::not_found())
}

/// Idle means no queued work and no outstanding I/O requests.
pub fn is_process_idle(process: Value) -> bool {
    if crate::maps::get_fifo_buffer_size(get_process_work_queue(process)) > 0 {
        return false;
    }
    get_process_airlock(process).open_request_count.load(Ordering::SeqCst) == 0
}

// ---------------------------------------------------------------------------
// Airlock
// ---------------------------------------------------------------------------

/// What an I/O operation produced, in native form; converted to heap values
/// at delivery on the interpreter thread.
pub enum IoPayload {
    /// Bytes read; becomes a blob.
    Bytes(Vec<u8>),
    /// A write's success flag; becomes a boolean.
    Flag(bool),
    /// The operation failed; the promise is rejected.
    Error(String),
}

/// A completed operation waiting to be delivered.
pub struct AirlockDelivery {
    /// Strong handle on the promise to settle.
    pub promise: SafeValue,
    pub payload: IoPayload,
}

/// Producer/consumer buffer between the engine thread and the interpreter.
/// The mutex guards only the buffer; the semaphores meter vacancies (writer
/// side) and availability (reader side).
pub struct Airlock {
    pub open_request_count: AtomicUsize,
    buffer: Mutex<VecDeque<AirlockDelivery>>,
    vacancies: Semaphore,
    availability: Semaphore,
}

impl Airlock {
    pub fn new(capacity: usize) -> Airlock {
        Airlock {
            open_request_count: AtomicUsize::new(0),
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            vacancies: Semaphore::new(capacity),
            availability: Semaphore::new(0),
        }
    }

    /// Called by the engine thread; blocks while the buffer is full.
    pub fn push(&self, delivery: AirlockDelivery) {
        self.vacancies.acquire();
        self.buffer.lock().push_back(delivery);
        self.availability.release();
    }

    /// Takes a delivery if one is available.
    pub fn try_take(&self) -> Option<AirlockDelivery> {
        if !self.availability.try_acquire() {
            return None;
        }
        let delivery = self.buffer.lock().pop_front().expect("airlock availability");
        self.vacancies.release();
        Some(delivery)
    }

    /// Blocks until a delivery is available or the timeout passes, without
    /// consuming it.
    pub fn wait_available(&self, timeout: std::time::Duration) -> bool {
        if self.availability.acquire_timeout(timeout) {
            self.availability.release();
            return true;
        }
        false
    }
}

/// Drains the airlock, settling promises with heap values. Runs on the
/// interpreter thread between jobs; fulfillments become observable at the
/// next job boundary.
pub fn deliver_pending_io(runtime: &mut Runtime, process: Value) -> Result<(), Condition> {
    let airlock = get_process_airlock(process);
    while let Some(delivery) = airlock.try_take() {
        let promise = delivery.promise.deref();
        match delivery.payload {
            IoPayload::Bytes(bytes) => {
                let (heap, roots) = runtime.heap_and_roots();
                let blob = crate::alloc::new_heap_blob_with_data(heap, roots, &bytes)?;
                fulfill_promise(promise, blob);
            }
            IoPayload::Flag(flag) => {
                fulfill_promise(promise, crate::core::tagged::new_boolean(flag));
            }
            IoPayload::Error(message) => {
                tracing::debug!(error = %message, "io operation failed");
                let (heap, roots) = runtime.heap_and_roots();
                let text = crate::alloc::new_heap_utf8(heap, roots, &message)?;
                reject_promise(promise, text);
            }
        }
        runtime.unprotect(delivery.promise);
        airlock.open_request_count.fetch_sub(1, Ordering::SeqCst);
    }
    Ok(())
}

/// Blocks until the engine delivers something for this process; the caller
/// drains with deliver_pending_io. Bounded wait so shutdown can't hang on a
/// lost completion.
pub fn wait_for_airlock_delivery(_runtime: &mut Runtime, process: Value) {
    let airlock = get_process_airlock(process);
    airlock.wait_available(std::time::Duration::from_millis(100));
}

// ---------------------------------------------------------------------------
// Process construction
// ---------------------------------------------------------------------------

pub const PROCESS_STACK_DEFAULT_CAPACITY: usize = 1024;

/// Allocates a full process: work queue, hash source, airlock, root task
/// with its stack. A weak self-destruct tracker releases the airlock when
/// the process dies.
pub fn new_heap_process(runtime: &mut Runtime) -> Result<Value, Condition> {
    let seed = runtime.heap.config.random_seed;
    let (heap, roots) = runtime.heap_and_roots();
    let work_queue =
        crate::alloc::new_heap_fifo_buffer(heap, roots, PROCESS_WORK_QUEUE_WIDTH, 16)?;
    let hash_source = crate::alloc::new_heap_hash_source(heap, roots, seed)?;
    let airlock = Arc::new(Airlock::new(16));
    let airlock_raw = Arc::into_raw(airlock) as usize;
    let airlock_ptr = crate::alloc::new_heap_void_p(heap, roots, airlock_raw)?;
    let process = crate::alloc::new_heap_process_raw(heap, roots, work_queue, hash_source, airlock_ptr)?;
    let stack = crate::alloc::new_heap_stack(heap, roots, PROCESS_STACK_DEFAULT_CAPACITY)?;
    let task = crate::alloc::new_heap_task(heap, roots, process, stack)?;
    set_heap_object_field(process, PROCESS_ROOT_TASK_OFFSET, task);
    // When the process is collected the finalizer drops the airlock Arc.
    runtime.heap.new_tracker(
        process,
        crate::heap::tracker_flags::ALWAYS_WEAK
            | crate::heap::tracker_flags::SELF_DESTRUCT
            | crate::heap::tracker_flags::FINALIZE,
        Some(Box::new(move || {
            unsafe { drop(Arc::from_raw(airlock_raw as *const Airlock)) };
        })),
    );
    Ok(process)
}
