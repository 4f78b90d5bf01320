//! Compute device abstraction.
//!
//! The batch integrator talks to a [`Device`]: an asynchronous queue of
//! buffer writes and kernel launches whose completion is observed through
//! [`Event`] handles. Real accelerator backends (OpenCL, CUDA) implement
//! this trait against their own queues; the crate ships [`HostDevice`], a
//! reference implementation that executes the update programs on a worker
//! thread, so the full pipeline runs and is testable without an
//! accelerator.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

use super::kernel::{self, KernelParams};

/// Identifier of a device buffer.
pub type BufferId = usize;

/// Completion handle for an asynchronous device operation.
///
/// Events are cheap to clone; all clones observe the same completion.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

struct EventInner {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    /// Create a pending event.
    pub fn new() -> Event {
        Event {
            inner: Arc::new(EventInner {
                done: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    /// Create an already-completed event.
    pub fn completed() -> Event {
        let event = Event::new();
        event.mark_complete();
        event
    }

    /// Signal completion, waking all waiters.
    pub fn mark_complete(&self) {
        let mut done = self.inner.done.lock();
        *done = true;
        self.inner.cond.notify_all();
    }

    /// True once the operation has completed.
    pub fn is_complete(&self) -> bool {
        *self.inner.done.lock()
    }

    /// Block until the operation completes.
    pub fn wait(&self) {
        let mut done = self.inner.done.lock();
        while !*done {
            self.inner.cond.wait(&mut done);
        }
    }

    /// Block until the operation completes or `timeout` elapses. Returns
    /// true when the operation completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.inner.done.lock();
        if *done {
            return true;
        }
        self.inner.cond.wait_for(&mut done, timeout);
        *done
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::new()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// The update programs a device must provide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kernel {
    /// Per-ray voxel traversal applying the log-odds miss/hit rule.
    RegionUpdate,
    /// Serialized per-sample pass updating mean, covariance, hit counts and
    /// the occupancy hit.
    NdtHit,
}

/// Buffer bindings for a kernel launch.
#[derive(Clone, Debug)]
pub struct KernelArgs {
    /// Per-layer (voxel buffer, per-region offsets buffer) pairs. The
    /// occupancy layer is always index 0; NDT launches add mean,
    /// covariance and hit/miss count layers in that order.
    pub voxel_buffers: Vec<(BufferId, BufferId)>,
    /// Region key list for the batch.
    pub region_keys: BufferId,
    /// Per-ray (start, end) voxel key pairs.
    pub keys: BufferId,
    /// Per-ray endpoint pairs, `f32` triples relative to the map origin.
    pub rays: BufferId,
    /// Scalar parameters.
    pub params: KernelParams,
}

/// A compute device executing the map update programs.
///
/// Submission is asynchronous: operations return immediately and complete
/// in submission order per device queue; completion is observed through
/// [`Event`]s. Buffers grow as needed on write, mirroring the resizable
/// buffers of the accelerator toolkits this abstracts.
pub trait Device: Send + Sync {
    /// Human-readable device name for logs.
    fn name(&self) -> &str;

    /// Allocate a device buffer of `byte_size` bytes.
    fn create_buffer(&self, byte_size: usize) -> Result<BufferId>;

    /// Asynchronously copy `data` into a buffer, growing it if required.
    /// The returned event completes when the buffer holds the data.
    fn write_buffer(&self, buffer: BufferId, offset: usize, data: &[u8]) -> Result<Event>;

    /// Download buffer contents into `out`, blocking until every
    /// previously queued operation touching the buffer has completed.
    fn read_buffer(&self, buffer: BufferId, offset: usize, out: &mut [u8]) -> Result<()>;

    /// Enqueue a kernel launch that runs after every event in `wait` has
    /// completed. The returned event completes when the kernel finishes.
    fn enqueue_kernel(&self, kernel: Kernel, args: KernelArgs, wait: &[Event]) -> Result<Event>;

    /// Order all previously enqueued operations before any enqueued later.
    fn insert_barrier(&self);
}

enum Op {
    Write {
        buffer: BufferId,
        offset: usize,
        data: Vec<u8>,
        event: Event,
    },
    Kernel {
        kernel: Kernel,
        args: KernelArgs,
        wait: Vec<Event>,
        event: Event,
    },
    Read {
        buffer: BufferId,
        offset: usize,
        len: usize,
        reply: Sender<Vec<u8>>,
    },
    Shutdown,
}

/// Reference device executing kernels on a single worker thread.
///
/// The worker drains its queue in submission order, which satisfies the
/// single-producer queue model: a barrier is implicit and wait lists only
/// matter for cross-queue composition. Kernel semantics are identical to
/// the host updater's arithmetic.
pub struct HostDevice {
    buffers: Arc<Mutex<Vec<Vec<u8>>>>,
    queue: Sender<Op>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HostDevice {
    /// Create the device and start its worker thread.
    pub fn new() -> Result<Arc<HostDevice>> {
        let buffers: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = unbounded::<Op>();

        let worker_buffers = buffers.clone();
        let worker = thread::Builder::new()
            .name("ghana-device".into())
            .spawn(move || {
                for op in rx {
                    match op {
                        Op::Write {
                            buffer,
                            offset,
                            data,
                            event,
                        } => {
                            let mut buffers = worker_buffers.lock();
                            let target = &mut buffers[buffer];
                            if target.len() < offset + data.len() {
                                target.resize(offset + data.len(), 0);
                            }
                            target[offset..offset + data.len()].copy_from_slice(&data);
                            drop(buffers);
                            event.mark_complete();
                        }
                        Op::Kernel {
                            kernel,
                            args,
                            wait,
                            event,
                        } => {
                            for dependency in &wait {
                                dependency.wait();
                            }
                            let mut buffers = worker_buffers.lock();
                            kernel::execute(kernel, &args, &mut buffers[..]);
                            drop(buffers);
                            event.mark_complete();
                        }
                        Op::Read {
                            buffer,
                            offset,
                            len,
                            reply,
                        } => {
                            let buffers = worker_buffers.lock();
                            let source = &buffers[buffer];
                            let end = (offset + len).min(source.len());
                            let mut data = source[offset.min(source.len())..end].to_vec();
                            data.resize(len, 0);
                            drop(buffers);
                            let _ = reply.send(data);
                        }
                        Op::Shutdown => break,
                    }
                }
            })
            .map_err(|e| Error::DeviceKernelFailed(format!("worker spawn failed: {}", e)))?;

        Ok(Arc::new(HostDevice {
            buffers,
            queue: tx,
            worker: Mutex::new(Some(worker)),
        }))
    }

    fn submit(&self, op: Op) -> Result<()> {
        self.queue
            .send(op)
            .map_err(|_| Error::DeviceKernelFailed("device queue closed".into()))
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn create_buffer(&self, byte_size: usize) -> Result<BufferId> {
        let mut buffers = self.buffers.lock();
        buffers.push(vec![0u8; byte_size]);
        Ok(buffers.len() - 1)
    }

    fn write_buffer(&self, buffer: BufferId, offset: usize, data: &[u8]) -> Result<Event> {
        let event = Event::new();
        self.submit(Op::Write {
            buffer,
            offset,
            data: data.to_vec(),
            event: event.clone(),
        })?;
        Ok(event)
    }

    fn read_buffer(&self, buffer: BufferId, offset: usize, out: &mut [u8]) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.submit(Op::Read {
            buffer,
            offset,
            len: out.len(),
            reply: reply_tx,
        })?;
        let data = reply_rx
            .recv()
            .map_err(|_| Error::DeviceKernelFailed("device worker stopped".into()))?;
        out.copy_from_slice(&data);
        Ok(())
    }

    fn enqueue_kernel(&self, kernel: Kernel, args: KernelArgs, wait: &[Event]) -> Result<Event> {
        let event = Event::new();
        self.submit(Op::Kernel {
            kernel,
            args,
            wait: wait.to_vec(),
            event: event.clone(),
        })?;
        Ok(event)
    }

    fn insert_barrier(&self) {
        // The single worker queue executes in submission order; the
        // barrier is implicit.
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        let _ = self.queue.send(Op::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_completion() {
        let event = Event::new();
        assert!(!event.is_complete());
        assert!(!event.wait_timeout(Duration::from_millis(1)));

        event.mark_complete();
        assert!(event.is_complete());
        event.wait();
        assert!(event.wait_timeout(Duration::from_millis(1)));

        assert!(Event::completed().is_complete());
    }

    #[test]
    fn test_write_then_read() {
        let device = HostDevice::new().unwrap();
        let buffer = device.create_buffer(8).unwrap();

        let event = device.write_buffer(buffer, 2, &[1, 2, 3]).unwrap();
        event.wait();

        let mut out = [0u8; 8];
        device.read_buffer(buffer, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 1, 2, 3, 0, 0, 0]);
    }

    #[test]
    fn test_write_grows_buffer() {
        let device = HostDevice::new().unwrap();
        let buffer = device.create_buffer(0).unwrap();

        device.write_buffer(buffer, 0, &[7; 16]).unwrap();

        let mut out = [0u8; 16];
        device.read_buffer(buffer, 0, &mut out).unwrap();
        assert_eq!(out, [7; 16]);
    }

    #[test]
    fn test_read_orders_after_writes() {
        // read_buffer must observe every queued write without explicit
        // waits.
        let device = HostDevice::new().unwrap();
        let buffer = device.create_buffer(4).unwrap();

        for value in 0..32u8 {
            device.write_buffer(buffer, 0, &[value]).unwrap();
        }
        let mut out = [0u8; 1];
        device.read_buffer(buffer, 0, &mut out).unwrap();
        assert_eq!(out[0], 31);
    }
}
