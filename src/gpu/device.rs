//! Compute device model: memory, buffers and the completion-callback thread.
//!
//! The device executes work asynchronously. Completion is reported through
//! [`Event`]s whose callbacks always run on the device's own callback thread,
//! never on the stack of the thread that registered them, so cache locks taken
//! inside a callback cannot collide with locks the registering thread holds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Allocation of {requested} bytes exceeds the device maximum of {max} bytes")]
    AllocationTooLarge { requested: usize, max: usize },

    #[error("{op}: region out of bounds (needs {needed} elements, buffer has {len})")]
    OutOfBounds {
        op: &'static str,
        needed: usize,
        len: usize,
    },

    #[error("{0}: source and destination are the same buffer")]
    Aliased(&'static str),

    #[error("Kernel {name} failed: {reason}")]
    KernelFailed { name: String, reason: String },

    #[error("Command queue {0} is closed")]
    QueueClosed(String),

    #[error("Device has shut down")]
    ShutDown,

    #[error("Failed to start device thread: {0}")]
    Spawn(String),
}

/// Information about the compute device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name.
    pub name: String,

    /// Total global memory in bytes.
    pub global_memory: usize,

    /// Largest single allocation in bytes.
    pub max_allocation: usize,
}

impl From<&DeviceConfig> for DeviceInfo {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            name: config.name.clone(),
            global_memory: config.global_memory,
            max_allocation: config.max_allocation,
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

pub(crate) struct DeviceShared {
    info: DeviceInfo,
    allocated: Mutex<usize>,
    next_buffer_id: AtomicU64,

    /// Work enqueued or callbacks dispatched but not yet finished.
    outstanding: Mutex<usize>,
    idle: Condvar,

    dispatcher: Mutex<Option<mpsc::Sender<Job>>>,
    callback_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceShared {
    pub(crate) fn begin_work(&self) {
        *self.outstanding.lock() += 1;
    }

    pub(crate) fn end_work(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    /// Run `job` on the callback thread.
    pub(crate) fn dispatch(self: &Arc<Self>, job: Job) {
        self.begin_work();
        let sent = match self.dispatcher.lock().as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        };
        if !sent {
            warn!(device = %self.info.name, "Callback dropped after device shutdown");
            self.end_work();
        }
    }

    fn release_memory(&self, bytes: usize) {
        let mut allocated = self.allocated.lock();
        *allocated = allocated.saturating_sub(bytes);
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        self.dispatcher.get_mut().take();
        if let Some(handle) = self.callback_thread.get_mut().take() {
            // The last handle may be released by a callback itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Handle to the compute device. Cheap to clone.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("info", &self.shared.info).finish()
    }
}

impl Device {
    /// Bring up a device and its callback thread.
    pub fn new(info: DeviceInfo) -> Result<Self, DeviceError> {
        let (tx, rx) = mpsc::channel::<Job>();
        let shared = Arc::new(DeviceShared {
            info,
            allocated: Mutex::new(0),
            next_buffer_id: AtomicU64::new(0),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
            dispatcher: Mutex::new(Some(tx)),
            callback_thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        let handle = thread::Builder::new()
            .name("device-callbacks".into())
            .spawn(move || callback_loop(rx, weak))
            .map_err(|e| DeviceError::Spawn(e.to_string()))?;
        *shared.callback_thread.lock() = Some(handle);

        info!(
            name = %shared.info.name,
            global_memory = shared.info.global_memory,
            max_allocation = shared.info.max_allocation,
            "Device ready"
        );

        Ok(Self { shared })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    /// Allocate a zeroed buffer of `len` floats.
    pub fn create_buffer(&self, len: usize) -> Result<DeviceBuffer, DeviceError> {
        let bytes = len * std::mem::size_of::<f32>();
        let info = &self.shared.info;
        if bytes > info.max_allocation {
            return Err(DeviceError::AllocationTooLarge {
                requested: bytes,
                max: info.max_allocation,
            });
        }

        {
            let mut allocated = self.shared.allocated.lock();
            let available = info.global_memory.saturating_sub(*allocated);
            if bytes > available {
                return Err(DeviceError::OutOfMemory {
                    requested: bytes,
                    available,
                });
            }
            *allocated += bytes;
        }

        let id = self.shared.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        debug!(buffer = id, bytes, "Allocated device buffer");
        Ok(DeviceBuffer {
            storage: Arc::new(BufferStorage {
                id,
                bytes,
                data: Mutex::new(vec![0.0; len]),
                device: Arc::downgrade(&self.shared),
            }),
        })
    }

    /// An event completed by the host through [`Event::complete`].
    pub fn create_user_event(&self) -> Event {
        Event::new(self.shared.clone())
    }

    /// Bytes currently allocated on the device.
    pub fn allocated_bytes(&self) -> usize {
        *self.shared.allocated.lock()
    }

    /// Block until every enqueued command has run and every callback returned.
    pub fn wait_idle(&self) {
        let mut outstanding = self.shared.outstanding.lock();
        while *outstanding > 0 {
            self.shared.idle.wait(&mut outstanding);
        }
    }
}

fn callback_loop(rx: mpsc::Receiver<Job>, device: Weak<DeviceShared>) {
    while let Ok(job) = rx.recv() {
        job();
        match device.upgrade() {
            Some(shared) => shared.end_work(),
            None => break,
        }
    }
    debug!("Device callback thread exiting");
}

struct BufferStorage {
    id: u64,
    bytes: usize,
    data: Mutex<Vec<f32>>,
    device: Weak<DeviceShared>,
}

impl Drop for BufferStorage {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            device.release_memory(self.bytes);
        }
        debug!(buffer = self.id, "Released device buffer");
    }
}

/// A device memory object. Clones refer to the same memory.
#[derive(Clone)]
pub struct DeviceBuffer {
    storage: Arc<BufferStorage>,
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.storage.id)
            .field("bytes", &self.storage.bytes)
            .finish()
    }
}

impl DeviceBuffer {
    pub fn id(&self) -> u64 {
        self.storage.id
    }

    /// Length in floats.
    pub fn len(&self) -> usize {
        self.storage.bytes / std::mem::size_of::<f32>()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.bytes == 0
    }

    pub fn same_buffer(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Direct access for kernels running on the device.
    pub fn lock(&self) -> MutexGuard<'_, Vec<f32>> {
        self.storage.data.lock()
    }

    /// Blocking read-back of the whole buffer.
    pub fn read_to_vec(&self) -> Vec<f32> {
        self.storage.data.lock().clone()
    }
}

type Callback = Box<dyn FnOnce(Result<(), DeviceError>) + Send>;

struct EventState {
    status: Option<Result<(), DeviceError>>,
    callbacks: Vec<Callback>,
}

struct EventInner {
    device: Arc<DeviceShared>,
    state: Mutex<EventState>,
    done: Condvar,
}

/// Completion status of an asynchronous device operation.
///
/// Callbacks registered with [`Event::on_complete`] are consumed exactly once,
/// on the device callback thread.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("status", &self.status())
            .finish()
    }
}

impl Event {
    pub(crate) fn new(device: Arc<DeviceShared>) -> Self {
        Self {
            inner: Arc::new(EventInner {
                device,
                state: Mutex::new(EventState {
                    status: None,
                    callbacks: Vec::new(),
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Register a completion callback.
    pub fn on_complete(&self, callback: impl FnOnce(Result<(), DeviceError>) + Send + 'static) {
        let mut state = self.inner.state.lock();
        match state.status.clone() {
            Some(status) => {
                drop(state);
                self.inner.device.dispatch(Box::new(move || callback(status)));
            }
            None => state.callbacks.push(Box::new(callback)),
        }
    }

    /// Mark the event complete. Returns false if it already was.
    pub fn complete(&self, status: Result<(), DeviceError>) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.status.is_some() {
                return false;
            }
            state.status = Some(status.clone());
            self.inner.done.notify_all();
            std::mem::take(&mut state.callbacks)
        };

        if !callbacks.is_empty() {
            self.inner.device.dispatch(Box::new(move || {
                for callback in callbacks {
                    callback(status.clone());
                }
            }));
        }
        true
    }

    pub fn status(&self) -> Option<Result<(), DeviceError>> {
        self.inner.state.lock().status.clone()
    }

    /// Block until the event completes.
    pub fn wait(&self) -> Result<(), DeviceError> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(status) = state.status.clone() {
                return status;
            }
            self.inner.done.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_device() -> Device {
        Device::new(DeviceInfo {
            name: "test".into(),
            global_memory: 1 << 20,
            max_allocation: 1 << 18,
        })
        .unwrap()
    }

    #[test]
    fn test_buffer_accounting() {
        let device = test_device();
        let a = device.create_buffer(1024).unwrap();
        assert_eq!(device.allocated_bytes(), 4096);
        let b = a.clone();
        drop(a);
        assert_eq!(device.allocated_bytes(), 4096);
        drop(b);
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn test_allocation_limits() {
        let device = test_device();
        assert!(matches!(
            device.create_buffer((1 << 18) / 4 + 1),
            Err(DeviceError::AllocationTooLarge { .. })
        ));

        let _held: Vec<_> = (0..4)
            .map(|_| device.create_buffer((1 << 18) / 4).unwrap())
            .collect();
        assert!(matches!(
            device.create_buffer(1),
            Err(DeviceError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_callbacks_run_off_thread() {
        let device = test_device();
        let event = device.create_user_event();
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();

        event.on_complete(move |status| {
            tx.send((status, thread::current().id())).unwrap();
        });
        assert!(event.complete(Ok(())));
        assert!(!event.complete(Ok(())));

        let (status, ran_on) = rx.recv().unwrap();
        assert_eq!(status, Ok(()));
        assert_ne!(ran_on, caller);
    }

    #[test]
    fn test_callback_after_completion_still_dispatched() {
        let device = test_device();
        let event = device.create_user_event();
        event.complete(Err(DeviceError::ShutDown));

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        event.on_complete(move |status| {
            assert_eq!(status, Err(DeviceError::ShutDown));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        device.wait_idle();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(event.wait(), Err(DeviceError::ShutDown));
    }
}
