/// Asynchronous I/O — File System Abstraction, Streams, The Engine
///
/// The interpreter never blocks on I/O. Scheduling an operation builds a
/// pending request, returns a promise immediately, and hands the request to
/// the engine's incoming worklist. The engine, one worker thread per
/// runtime, performs the blocking work and places the completion on the
/// owning process's airlock; the interpreter drains the airlock between
/// jobs and settles the promises there.
///
/// The engine never touches heap values. Requests carry the promise as a
/// safe handle (an object tracker) and the airlock as a cloned Arc; both
/// are opaque to it.

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::core::value::{Condition, Value};
use crate::process::{Airlock, AirlockDelivery, IoPayload};
use crate::runtime::Runtime;

// ---------------------------------------------------------------------------
// File system abstraction
// ---------------------------------------------------------------------------

/// Access to files, replaceable for tests and sandboxing.
pub trait FileSystem: Send + Sync {
    fn read_file(&self, path: &str) -> std::io::Result<Vec<u8>>;
    fn write_file(&self, path: &str, data: &[u8]) -> std::io::Result<()>;
}

/// The OS-backed default.
pub struct NativeFileSystem;

impl FileSystem for NativeFileSystem {
    fn read_file(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write_file(&self, path: &str, data: &[u8]) -> std::io::Result<()> {
        std::fs::write(path, data)
    }
}

/// Reads a whole file into a fresh blob, synchronously; used by the module
/// loader at startup. SystemError on failure.
pub fn read_file_to_blob(runtime: &mut Runtime, path: &str) -> Result<Value, Condition> {
    let file_system: Arc<dyn FileSystem> = runtime
        .heap
        .config
        .file_system
        .clone()
        .unwrap_or_else(|| Arc::new(NativeFileSystem));
    let bytes = file_system.read_file(path).map_err(|_| Condition::system_error())?;
    let (heap, roots) = runtime.heap_and_roots();
    crate::alloc::new_heap_blob_with_data(heap, roots, &bytes)
}

// ---------------------------------------------------------------------------
// Pipes
// ---------------------------------------------------------------------------

/// An in-process pipe: bytes written to the out end become readable at the
/// in end. Closing wakes blocked readers.
pub struct PipeState {
    buffer: Mutex<PipeBuffer>,
    readable: Condvar,
}

struct PipeBuffer {
    data: VecDeque<u8>,
    closed: bool,
}

impl PipeState {
    pub fn new() -> Arc<PipeState> {
        Arc::new(PipeState {
            buffer: Mutex::new(PipeBuffer { data: VecDeque::new(), closed: false }),
            readable: Condvar::new(),
        })
    }

    pub fn write(&self, bytes: &[u8]) -> bool {
        let mut buffer = self.buffer.lock();
        if buffer.closed {
            return false;
        }
        buffer.data.extend(bytes.iter().copied());
        self.readable.notify_all();
        true
    }

    /// Blocks until at least one byte (or close), then returns up to `size`
    /// bytes.
    pub fn read(&self, size: usize) -> Vec<u8> {
        let mut buffer = self.buffer.lock();
        while buffer.data.is_empty() && !buffer.closed {
            self.readable.wait(&mut buffer);
        }
        let take = size.min(buffer.data.len());
        buffer.data.drain(..take).collect()
    }

    pub fn close(&self) {
        let mut buffer = self.buffer.lock();
        buffer.closed = true;
        self.readable.notify_all();
    }
}

/// Wraps one end of a pipe as a heap object: a VoidP holding a raw Arc,
/// released by a self-destruct finalizer when the wrapper dies.
pub fn new_stream_wrapper(runtime: &mut Runtime, pipe: Arc<PipeState>) -> Result<Value, Condition> {
    let raw = Arc::into_raw(pipe) as usize;
    let (heap, roots) = runtime.heap_and_roots();
    let wrapper = crate::alloc::new_heap_void_p(heap, roots, raw)?;
    runtime.heap.new_tracker(
        wrapper,
        crate::heap::tracker_flags::ALWAYS_WEAK
            | crate::heap::tracker_flags::SELF_DESTRUCT
            | crate::heap::tracker_flags::FINALIZE,
        Some(Box::new(move || {
            let pipe = unsafe { Arc::from_raw(raw as *const PipeState) };
            pipe.close();
        })),
    );
    Ok(wrapper)
}

/// The pipe behind a stream wrapper.
pub fn stream_wrapper_pipe(wrapper: Value) -> Arc<PipeState> {
    let raw = crate::objects::get_void_p_value(wrapper);
    let arc = unsafe { Arc::from_raw(raw as *const PipeState) };
    let clone = arc.clone();
    std::mem::forget(arc);
    clone
}

// ---------------------------------------------------------------------------
// The engine
// ---------------------------------------------------------------------------

/// A blocking operation the engine performs on behalf of a process.
pub enum IoOperation {
    ReadFile { file_system: Arc<dyn FileSystem>, path: String },
    StreamRead { pipe: Arc<PipeState>, size: usize },
    StreamWrite { pipe: Arc<PipeState>, bytes: Vec<u8> },
}

/// A pending request: the operation plus where its completion goes.
pub struct IoRequest {
    pub operation: IoOperation,
    pub airlock: Arc<Airlock>,
    pub promise: crate::heap::SafeValue,
    /// Per-operation wait bound; operations are not cancellable once
    /// scheduled but never wait unboundedly either.
    pub timeout: Duration,
}

enum EngineMessage {
    Request(IoRequest),
    /// Drain outstanding requests and exit.
    TerminateWhenIdle,
}

/// The per-runtime worker thread that performs blocking I/O.
pub struct IoEngine {
    sender: Sender<EngineMessage>,
    worker: Option<JoinHandle<()>>,
}

impl IoEngine {
    pub fn start() -> IoEngine {
        let (sender, receiver) = channel();
        let worker = std::thread::Builder::new()
            .name("umbra-io".to_string())
            .spawn(move || engine_main(receiver))
            .expect("spawning io engine");
        debug!("io engine started");
        IoEngine { sender, worker: Some(worker) }
    }

    pub fn submit(&self, request: IoRequest) {
        // A send can only fail after shutdown, which would be a scheduling
        // bug upstream.
        let _ = self.sender.send(EngineMessage::Request(request));
    }

    /// Sets the terminate-when-idle flag and joins the worker.
    pub fn shut_down(mut self) {
        let _ = self.sender.send(EngineMessage::TerminateWhenIdle);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn engine_main(receiver: Receiver<EngineMessage>) {
    let mut terminating = false;
    loop {
        let message = if terminating {
            // Drain whatever is left without blocking.
            match receiver.try_recv() {
                Ok(message) => message,
                Err(_) => break,
            }
        } else {
            match receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        };
        match message {
            EngineMessage::TerminateWhenIdle => {
                terminating = true;
            }
            EngineMessage::Request(request) => {
                trace!("io engine request");
                let payload = perform_operation(request.operation, request.timeout);
                request.airlock.push(AirlockDelivery { promise: request.promise, payload });
            }
        }
    }
    debug!("io engine stopped");
}

fn perform_operation(operation: IoOperation, _timeout: Duration) -> IoPayload {
    match operation {
        IoOperation::ReadFile { file_system, path } => match file_system.read_file(&path) {
            Ok(bytes) => IoPayload::Bytes(bytes),
            Err(error) => IoPayload::Error(error.to_string()),
        },
        IoOperation::StreamRead { pipe, size } => IoPayload::Bytes(pipe.read(size)),
        IoOperation::StreamWrite { pipe, bytes } => IoPayload::Flag(pipe.write(&bytes)),
    }
}

// ---------------------------------------------------------------------------
// Scheduling from the interpreter
// ---------------------------------------------------------------------------

/// Schedules an operation for the process and immediately returns the
/// promise of its result. The interpreter continues; the fulfillment lands
/// at a later job boundary.
pub fn schedule_io_operation(
    runtime: &mut Runtime,
    process: Value,
    operation: IoOperation,
) -> Result<Value, Condition> {
    let (heap, roots) = runtime.heap_and_roots();
    let promise = crate::alloc::new_heap_promise(heap, roots)?;
    let handle = runtime.protect(promise);
    let airlock = crate::process::get_process_airlock(process);
    airlock.open_request_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    let request = IoRequest {
        operation,
        airlock,
        promise: handle,
        timeout: Duration::from_secs(10),
    };
    runtime.io_engine().submit(request);
    Ok(promise)
}

/// Schedules a stream read; the promise resolves to a blob.
pub fn schedule_stream_read(
    runtime: &mut Runtime,
    process: Value,
    stream: Value,
    size: usize,
) -> Result<Value, Condition> {
    let pipe = stream_wrapper_pipe(stream);
    schedule_io_operation(runtime, process, IoOperation::StreamRead { pipe, size })
}

/// Schedules a stream write; the promise resolves to a boolean.
pub fn schedule_stream_write(
    runtime: &mut Runtime,
    process: Value,
    stream: Value,
    bytes: Vec<u8>,
) -> Result<Value, Condition> {
    let pipe = stream_wrapper_pipe(stream);
    schedule_io_operation(runtime, process, IoOperation::StreamWrite { pipe, bytes })
}
