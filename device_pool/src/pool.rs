use std::{
    any::Any,
    fmt::Display,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        mpsc::{self, Receiver, Sender},
    },
    thread::{self, JoinHandle},
};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{Device, PoolErr, Result};

type WorkerFn<T, R> = dyn Fn(T, Device) -> std::result::Result<R, String> + Send + Sync;

struct Task<T> {
    id: u64,
    payload: T,
}

/// The result of one task, tagged with the worker that ran it.
#[derive(Debug)]
pub struct TaskOutcome<R> {
    pub task_id: u64,
    pub slot: usize,
    pub device: Device,
    pub result: Result<R>,
}

/// A fixed set of worker threads, each bound to one device for its whole lifetime.
///
/// Tasks are queued in submission order on a channel shared by every worker, outcomes
/// come back on a second channel. Nothing else is shared between the caller and the
/// workers.
pub struct DeviceWorkerPool<T, R> {
    devices: Vec<Device>,
    worker_fn: Arc<WorkerFn<T, R>>,
    tasks_tx: Option<Sender<Task<T>>>,
    tasks_rx: Arc<Mutex<Receiver<Task<T>>>>,
    results_tx: Option<Sender<TaskOutcome<R>>>,
    results_rx: Receiver<TaskOutcome<R>>,
    handles: Vec<(usize, JoinHandle<()>)>,
    next_task: u64,
    pending: usize,
    started: bool,
}

impl<T, R> DeviceWorkerPool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Creates a new `DeviceWorkerPool` with one worker slot per device.
    ///
    /// # Arguments
    /// * `worker_fn` - Runs a task payload on the worker's bound device.
    /// * `devices` - The available devices, slot `i` is bound to `devices[i % len]`.
    ///
    /// # Returns
    /// A new pool, not yet started, or `NoDevices` for an empty device list.
    pub fn new<F, E>(worker_fn: F, devices: Vec<Device>) -> Result<Self>
    where
        F: Fn(T, Device) -> std::result::Result<R, E> + Send + Sync + 'static,
        E: Display,
    {
        if devices.is_empty() {
            return Err(PoolErr::NoDevices);
        }

        let (tasks_tx, tasks_rx) = mpsc::channel();
        let (results_tx, results_rx) = mpsc::channel();
        let worker_fn: Arc<WorkerFn<T, R>> =
            Arc::new(move |payload, device| worker_fn(payload, device).map_err(|e| e.to_string()));

        Ok(Self {
            devices,
            worker_fn,
            tasks_tx: Some(tasks_tx),
            tasks_rx: Arc::new(Mutex::new(tasks_rx)),
            results_tx: Some(results_tx),
            results_rx,
            handles: Vec::new(),
            next_task: 0,
            pending: 0,
            started: false,
        })
    }

    /// Returns the amount of worker slots.
    pub fn workers(&self) -> usize {
        self.devices.len()
    }

    /// Returns the device the worker in `slot` is bound to.
    pub fn device_for_slot(&self, slot: usize) -> Device {
        self.devices[slot % self.devices.len()]
    }

    /// Spawns every worker, calling it again is a no-op.
    ///
    /// # Returns
    /// `Stopped` if the pool was already stopped, or a spawn failure.
    pub fn start(&mut self) -> Result<()> {
        if self.tasks_tx.is_none() {
            return Err(PoolErr::Stopped);
        }

        if self.started {
            return Ok(());
        }

        let Some(results_tx) = self.results_tx.take() else {
            return Err(PoolErr::Stopped);
        };

        self.started = true;
        for slot in 0..self.workers() {
            let device = self.device_for_slot(slot);
            let tasks = Arc::clone(&self.tasks_rx);
            let results = results_tx.clone();
            let worker_fn = Arc::clone(&self.worker_fn);

            let handle = thread::Builder::new()
                .name(format!("device-worker-{slot}"))
                .spawn(move || run_worker(slot, device, tasks, results, worker_fn))?;

            self.handles.push((slot, handle));
        }

        info!(workers = self.handles.len(); "device pool started");
        Ok(())
    }

    /// Queues a task, it never blocks.
    ///
    /// # Returns
    /// The task id reported back in its `TaskOutcome`, or `Stopped`.
    pub fn add_task(&mut self, payload: T) -> Result<u64> {
        let tx = self.tasks_tx.as_ref().ok_or(PoolErr::Stopped)?;
        let id = self.next_task;

        tx.send(Task { id, payload }).map_err(|_| PoolErr::Stopped)?;
        self.next_task += 1;
        self.pending += 1;

        Ok(id)
    }

    /// Waits for the next finished task.
    ///
    /// # Returns
    /// `None` when no submitted task is still outstanding, or when the pool never
    /// started and so can't produce it.
    pub fn recv_result(&mut self) -> Option<TaskOutcome<R>> {
        if self.pending == 0 || !self.started {
            return None;
        }

        let outcome = self.results_rx.recv().ok()?;
        self.pending -= 1;
        Some(outcome)
    }

    /// Waits for every outstanding task, in completion order.
    pub fn drain_results(&mut self) -> Vec<TaskOutcome<R>> {
        let mut outcomes = Vec::with_capacity(self.pending);
        while let Some(outcome) = self.recv_result() {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Stops accepting tasks, lets the workers finish the queued ones and joins them.
    ///
    /// It is safe to call repeatedly, outcomes of finished tasks stay available
    /// through `recv_result`.
    ///
    /// # Returns
    /// A `WorkerFailure` if a worker thread died outside of a task.
    pub fn stop(&mut self) -> Result<()> {
        self.tasks_tx.take();
        self.results_tx.take();

        let mut failure = None;
        for (slot, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                let device = self.devices[slot % self.devices.len()];
                warn!(slot = slot; "worker on {device} died");
                failure.get_or_insert(PoolErr::WorkerFailure {
                    slot,
                    device,
                    detail: "worker thread panicked".to_string(),
                });
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<T, R> Drop for DeviceWorkerPool<T, R> {
    fn drop(&mut self) {
        self.tasks_tx.take();
        for (_, handle) in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_worker<T, R>(
    slot: usize,
    device: Device,
    tasks: Arc<Mutex<Receiver<Task<T>>>>,
    results: Sender<TaskOutcome<R>>,
    worker_fn: Arc<WorkerFn<T, R>>,
) {
    debug!(slot = slot; "worker bound to {device}");

    loop {
        let task = tasks.lock().recv();
        let Ok(Task { id, payload }) = task else {
            break;
        };

        let result = match panic::catch_unwind(AssertUnwindSafe(|| worker_fn(payload, device))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(detail)) => Err(detail),
            Err(panic) => Err(panic_detail(panic)),
        }
        .map_err(|detail| {
            warn!(slot = slot, task_id = id; "task failed on {device}: {detail}");
            PoolErr::WorkerFailure {
                slot,
                device,
                detail,
            }
        });

        let outcome = TaskOutcome {
            task_id: id,
            slot,
            device,
            result,
        };

        if results.send(outcome).is_err() {
            break;
        }
    }

    debug!(slot = slot; "worker on {device} exiting");
}

fn panic_detail(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(msg) => *msg,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(msg) => msg.to_string(),
            Err(_) => "worker panicked".to_string(),
        },
    }
}
