//! Per-device worker thread
//!
//! Every GPU-mutating call for a device runs on that device's single worker
//! thread. Callers enqueue closures through a channel and, when they need a
//! result, wait on the [`TaskHandle`] returned by [`LogicalDevice::execute`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender};

use crate::render::device::PhysicalDeviceInfo;
use crate::render::error::{RenderError, RenderResult};
use crate::render::hal::DeviceDriver;

type DeviceTask = Box<dyn FnOnce(&dyn DeviceDriver) + Send + 'static>;

enum WorkerMessage {
    Run(DeviceTask),
    Wake,
}

/// Pending result of a task queued on a device worker
#[must_use = "dropping a TaskHandle does not cancel the task"]
pub struct TaskHandle<R> {
    device: usize,
    receiver: Receiver<R>,
}

impl<R> TaskHandle<R> {
    /// Block until the task has run
    ///
    /// Fails with [`RenderError::WorkerStopped`] when the worker shut down
    /// before running the task or the task panicked.
    pub fn wait(self) -> RenderResult<R> {
        self.receiver
            .recv()
            .map_err(|_| RenderError::WorkerStopped(self.device))
    }
}

/// Wait on every handle, returning results in submission order
pub fn join_all<R>(handles: Vec<TaskHandle<R>>) -> Vec<RenderResult<R>> {
    handles.into_iter().map(TaskHandle::wait).collect()
}

/// One opened GPU: its driver plus the worker thread serializing access to it
pub struct LogicalDevice {
    index: usize,
    info: PhysicalDeviceInfo,
    driver: Arc<dyn DeviceDriver>,
    sender: Sender<WorkerMessage>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl LogicalDevice {
    /// Start the worker thread for an opened driver
    ///
    /// `index` is the device's stable position in the group (0 = primary).
    pub fn spawn(index: usize, info: PhysicalDeviceInfo, driver: Arc<dyn DeviceDriver>) -> RenderResult<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let worker_driver = Arc::clone(&driver);
        let worker_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("gpu-worker-{}", index))
            .spawn(move || worker_loop(index, worker_driver, receiver, worker_stop))
            .map_err(|e| RenderError::Device {
                device: index,
                reason: format!("failed to spawn worker thread: {}", e),
            })?;
        let worker_id = handle.thread().id();

        log::debug!("Started worker for device {} ({})", index, info.name);
        Ok(Self {
            index,
            info,
            driver,
            sender,
            stop,
            worker: Mutex::new(Some(handle)),
            worker_id,
        })
    }

    /// Stable index of this device in its group
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether this is the primary device
    pub fn is_primary(&self) -> bool {
        self.index == 0
    }

    /// Physical device this was opened on
    pub fn info(&self) -> &PhysicalDeviceInfo {
        &self.info
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Direct driver access
    ///
    /// Only for host-side mapped memory access and recording into a frame slot
    /// the caller owns; everything else goes through [`Self::execute`].
    pub fn driver(&self) -> &dyn DeviceDriver {
        self.driver.as_ref()
    }

    /// Identity of the worker thread
    pub fn worker_thread_id(&self) -> ThreadId {
        self.worker_id
    }

    /// Whether the worker still accepts tasks
    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Acquire)
    }

    /// Enqueue a closure on the worker and return immediately
    pub fn submit_task<F>(&self, task: F) -> RenderResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(move |_driver: &dyn DeviceDriver| task()))
    }

    /// Enqueue a closure receiving the driver and get a handle to its result
    pub fn execute<R, F>(&self, task: F) -> TaskHandle<R>
    where
        R: Send + 'static,
        F: FnOnce(&dyn DeviceDriver) -> R + Send + 'static,
    {
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let queued = self.enqueue(Box::new(move |driver: &dyn DeviceDriver| {
            let _ = result_tx.send(task(driver));
        }));
        if let Err(e) = queued {
            log::warn!("{}", e);
        }
        TaskHandle {
            device: self.index,
            receiver: result_rx,
        }
    }

    fn enqueue(&self, task: DeviceTask) -> RenderResult<()> {
        if !self.is_running() {
            return Err(RenderError::WorkerStopped(self.index));
        }
        self.sender
            .send(WorkerMessage::Run(task))
            .map_err(|_| RenderError::WorkerStopped(self.index))
    }

    /// Block until every previously submitted task has run and the GPU is idle
    pub fn wait_idle(&self) -> RenderResult<()> {
        self.execute(|driver| driver.wait_idle()).wait()?
    }

    /// Stop the worker and join it
    ///
    /// Tasks still queued are dropped; callers run [`Self::wait_idle`] first.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.sender.send(WorkerMessage::Wake);

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Worker for device {} panicked during shutdown", self.index);
            }
            log::debug!("Stopped worker for device {}", self.index);
        }
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        // The driver (and its allocator) is released after this returns, i.e.
        // only once the worker has been joined.
        self.shutdown();
    }
}

impl std::fmt::Debug for LogicalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalDevice")
            .field("index", &self.index)
            .field("name", &self.info.name)
            .field("running", &self.is_running())
            .finish()
    }
}

fn worker_loop(index: usize, driver: Arc<dyn DeviceDriver>, receiver: Receiver<WorkerMessage>, stop: Arc<AtomicBool>) {
    for message in receiver.iter() {
        if stop.load(Ordering::Acquire) {
            break;
        }
        if let WorkerMessage::Run(task) = message {
            let driver = driver.as_ref();
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task(driver))).is_err() {
                log::error!("Task panicked on gpu-worker-{}", index);
            }
        }
    }
    log::trace!("gpu-worker-{} exiting", index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::HeadlessBackend;
    use crate::render::capabilities::Capabilities;
    use crate::render::hal::GpuBackend;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn device() -> LogicalDevice {
        let backend = HeadlessBackend::with_devices(1);
        let info = backend.enumerate_physical_devices().unwrap().remove(0);
        let capabilities = Capabilities::new();
        let features = capabilities.get_features(&info).unwrap();
        let driver = backend.open_device(&info, &features, &[]).unwrap();
        LogicalDevice::spawn(0, info, driver).unwrap()
    }

    #[test]
    fn test_tasks_run_in_order_on_worker() {
        let device = device();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let order = Arc::clone(&order);
            device.submit_task(move || order.lock().unwrap().push(i)).unwrap();
        }
        let thread = device.execute(|_| thread::current().id()).wait().unwrap();

        assert_eq!(thread, device.worker_thread_id());
        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_wait_idle_flushes_queue() {
        let device = device();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let done = Arc::clone(&done);
            device
                .submit_task(move || {
                    thread::sleep(Duration::from_millis(2));
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        device.wait_idle().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let device = device();
        let failed = device.execute(|_| -> u32 { panic!("boom") }).wait();
        assert!(matches!(failed, Err(RenderError::WorkerStopped(0))));
        assert_eq!(device.execute(|_| 7).wait().unwrap(), 7);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let device = device();
        device.shutdown();
        assert!(!device.is_running());
        assert!(device.submit_task(|| {}).is_err());
        assert!(matches!(device.execute(|_| ()).wait(), Err(RenderError::WorkerStopped(0))));
        device.shutdown();
    }
}
