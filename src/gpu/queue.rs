//! In-order command queue.
//!
//! Commands run one at a time on the queue's executor thread, in submission
//! order, so a command never observes a buffer before earlier commands on the
//! same queue have finished with it. Each command returns an [`Event`] that
//! completes when the command has run.

use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::gpu::device::{Device, DeviceBuffer, DeviceError, DeviceShared, Event};

/// Host memory a queue can read from. Writers take the lock only while the
/// owning cache holds the slot exclusively.
pub type HostBuffer = Arc<RwLock<Vec<f32>>>;

/// A 2-D region of `rows` rows of `row_len` floats, with independent row
/// pitches on the source and destination side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RectRegion {
    pub row_len: usize,
    pub rows: usize,
    pub src_pitch: usize,
    pub dst_pitch: usize,
}

impl RectRegion {
    fn check(&self, op: &'static str, src_len: usize, dst_len: usize) -> Result<(), DeviceError> {
        if self.rows == 0 {
            return Ok(());
        }
        let src_needed = (self.rows - 1) * self.src_pitch + self.row_len;
        if src_needed > src_len {
            return Err(DeviceError::OutOfBounds {
                op,
                needed: src_needed,
                len: src_len,
            });
        }
        let dst_needed = (self.rows - 1) * self.dst_pitch + self.row_len;
        if dst_needed > dst_len {
            return Err(DeviceError::OutOfBounds {
                op,
                needed: dst_needed,
                len: dst_len,
            });
        }
        Ok(())
    }

    /// Copy the region row by row. Elements between rows are left untouched.
    pub fn copy(&self, op: &'static str, src: &[f32], dst: &mut [f32]) -> Result<(), DeviceError> {
        self.check(op, src.len(), dst.len())?;
        for row in 0..self.rows {
            let s = row * self.src_pitch;
            let d = row * self.dst_pitch;
            dst[d..d + self.row_len].copy_from_slice(&src[s..s + self.row_len]);
        }
        Ok(())
    }

    /// Floats moved by one transfer of this region.
    pub fn elements(&self) -> usize {
        self.row_len * self.rows
    }
}

/// Device-side body of a kernel command.
pub type KernelFn = Box<dyn FnOnce() -> Result<(), DeviceError> + Send>;

enum Operation {
    WriteRect {
        src: HostBuffer,
        dst: DeviceBuffer,
        region: RectRegion,
    },
    CopyRect {
        src: DeviceBuffer,
        dst: DeviceBuffer,
        region: RectRegion,
    },
    Kernel {
        name: String,
        run: KernelFn,
    },
    Marker,
}

impl Operation {
    fn execute(self) -> Result<(), DeviceError> {
        match self {
            Operation::WriteRect { src, dst, region } => {
                let src = src.read();
                let mut dst = dst.lock();
                region.copy("write_rect", &src, &mut dst)
            }
            Operation::CopyRect { src, dst, region } => {
                if src.same_buffer(&dst) {
                    return Err(DeviceError::Aliased("copy_rect"));
                }
                let src = src.lock();
                let mut dst = dst.lock();
                region.copy("copy_rect", &src, &mut dst)
            }
            Operation::Kernel { name, run } => {
                debug!(kernel = %name, "Running kernel");
                run()
            }
            Operation::Marker => Ok(()),
        }
    }
}

struct Command {
    operation: Operation,
    event: Event,
}

/// An in-order queue bound to one device.
pub struct CommandQueue {
    name: String,
    device: Device,
    tx: Mutex<Option<mpsc::Sender<Command>>>,
    executor: Mutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    pub fn new(device: &Device, name: impl Into<String>) -> Result<Self, DeviceError> {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Command>();
        let shared = device.shared().clone();
        let executor = thread::Builder::new()
            .name(format!("queue-{name}"))
            .spawn(move || execute_loop(rx, shared))
            .map_err(|e| DeviceError::Spawn(e.to_string()))?;

        Ok(Self {
            name,
            device: device.clone(),
            tx: Mutex::new(Some(tx)),
            executor: Mutex::new(Some(executor)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn submit(&self, operation: Operation) -> Result<Event, DeviceError> {
        let event = self.device.create_user_event();
        let shared = self.device.shared();
        shared.begin_work();

        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx
                .send(Command {
                    operation,
                    event: event.clone(),
                })
                .is_ok(),
            None => false,
        };
        if !sent {
            shared.end_work();
            return Err(DeviceError::QueueClosed(self.name.clone()));
        }
        Ok(event)
    }

    /// Asynchronous host → device copy.
    pub fn enqueue_write_rect(
        &self,
        src: &HostBuffer,
        dst: &DeviceBuffer,
        region: RectRegion,
    ) -> Result<Event, DeviceError> {
        self.submit(Operation::WriteRect {
            src: src.clone(),
            dst: dst.clone(),
            region,
        })
    }

    /// Asynchronous device → device copy.
    pub fn enqueue_copy_rect(
        &self,
        src: &DeviceBuffer,
        dst: &DeviceBuffer,
        region: RectRegion,
    ) -> Result<Event, DeviceError> {
        self.submit(Operation::CopyRect {
            src: src.clone(),
            dst: dst.clone(),
            region,
        })
    }

    /// Run `run` on the device after all earlier commands.
    pub fn enqueue_kernel(
        &self,
        name: impl Into<String>,
        run: impl FnOnce() -> Result<(), DeviceError> + Send + 'static,
    ) -> Result<Event, DeviceError> {
        self.submit(Operation::Kernel {
            name: name.into(),
            run: Box::new(run),
        })
    }

    /// Event that completes once everything submitted so far has run.
    pub fn enqueue_marker(&self) -> Result<Event, DeviceError> {
        self.submit(Operation::Marker)
    }

    /// Block until everything submitted so far has run.
    pub fn finish(&self) -> Result<(), DeviceError> {
        self.enqueue_marker()?.wait()
    }

    /// Stop accepting commands and join the executor once it drains.
    pub fn close(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.executor.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.close();
    }
}

fn execute_loop(rx: mpsc::Receiver<Command>, device: Arc<DeviceShared>) {
    while let Ok(Command { operation, event }) = rx.recv() {
        let status = operation.execute();
        if let Err(e) = &status {
            error!(error = %e, "Device command failed");
        }
        event.complete(status);
        device.end_work();
    }
}
