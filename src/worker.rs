//! Background worker threads.
//!
//! A [`PersistentWorker`] runs one closure repeatedly on its own thread,
//! sleeping between rounds until woken, until an optional interval passes,
//! or until stopped. A [`QueuedWorker`] feeds items from a bounded queue to
//! a handler on its own thread, optionally calling it with no items when
//! the queue stays empty for an interval. Both expose a [`WorkerControl`] that long
//! running work polls through [`WorkerControl::is_cancelled`].

use crate::error::{Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Default)]
struct ControlState {
    cancelled: bool,
    wake_pending: bool,
}

/// Cancellation and wake-up signal shared with a worker thread.
#[derive(Debug, Default)]
pub struct WorkerControl {
    state: Mutex<ControlState>,
    cond: Condvar,
}

impl WorkerControl {
    /// A control that is neither cancelled nor woken.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the worker has been asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Ask the worker to stop.
    pub fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.cond.notify_all();
    }

    /// Ask the worker for another round.
    pub fn wake(&self) {
        self.state.lock().wake_pending = true;
        self.cond.notify_all();
    }

    /// Return an error if cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    // Sleep until woken, cancelled or the interval passes.
    fn sleep(&self, interval: Option<Duration>) {
        let mut state = self.state.lock();
        while !state.cancelled && !state.wake_pending {
            match interval {
                Some(interval) => {
                    if self.cond.wait_for(&mut state, interval).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        state.wake_pending = false;
    }
}

fn join_worker(name: &str, handle: Option<JoinHandle<()>>) -> Result<()> {
    match handle {
        Some(handle) => handle
            .join()
            .map_err(|_| Error::internal(format!("worker {} panicked", name))),
        None => Ok(()),
    }
}

/// A thread that repeats a unit of work until stopped.
#[derive(Debug)]
pub struct PersistentWorker {
    name: String,
    control: Arc<WorkerControl>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentWorker {
    /// A stopped worker.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), control: Arc::new(WorkerControl::new()), handle: Mutex::new(None) }
    }

    /// Start running `work`, once immediately and then again after every
    /// wake-up or every `interval`.
    pub fn start<F>(&self, interval: Option<Duration>, mut work: F) -> Result<()>
    where
        F: FnMut(&WorkerControl) + Send + 'static,
    {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(Error::invalid_state(format!("worker {} already started", self.name)));
        }
        let control = Arc::clone(&self.control);
        let name = self.name.clone();
        *handle = Some(thread::Builder::new().name(self.name.clone()).spawn(move || {
            log::debug!("Worker {} started", name);
            while !control.is_cancelled() {
                work(&control);
                control.sleep(interval);
            }
            log::debug!("Worker {} stopped", name);
        })?);
        Ok(())
    }

    /// Ask the worker to stop after its current round.
    pub fn stop(&self) {
        self.control.cancel();
    }

    /// Wait for the worker thread to exit.
    pub fn wait(&self) -> Result<()> {
        let handle = self.handle.lock().take();
        join_worker(&self.name, handle)
    }

    /// Request another round as soon as the current one ends.
    pub fn wake(&self) {
        self.control.wake();
    }

    /// True once stopped.
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// The worker's control.
    pub fn control(&self) -> &Arc<WorkerControl> {
        &self.control
    }
}

impl Drop for PersistentWorker {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = self.wait() {
            log::error!("{}", e);
        }
    }
}

/// A thread handling items from a bounded queue.
///
/// Items that are already queued when the handler becomes free are passed
/// to it together, up to `max_batch` at a time.
pub struct QueuedWorker<T: Send + 'static> {
    name: String,
    sender: Mutex<Option<Sender<T>>>,
    control: Arc<WorkerControl>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> QueuedWorker<T> {
    /// Start a worker with a queue of `depth` items.
    pub fn start<F>(name: impl Into<String>, depth: usize, max_batch: usize, handler: F) -> Result<Self>
    where
        F: FnMut(Vec<T>, &WorkerControl) + Send + 'static,
    {
        Self::start_with_idle(name, depth, max_batch, None, handler)
    }

    /// Start a worker that also calls `handler` with an empty batch each
    /// time the queue stays empty for `idle`.
    pub fn start_with_idle<F>(
        name: impl Into<String>,
        depth: usize,
        max_batch: usize,
        idle: Option<Duration>,
        mut handler: F,
    ) -> Result<Self>
    where
        F: FnMut(Vec<T>, &WorkerControl) + Send + 'static,
    {
        let name = name.into();
        let (sender, receiver): (Sender<T>, Receiver<T>) = channel::bounded(depth.max(1));
        let control = Arc::new(WorkerControl::new());
        let thread_control = Arc::clone(&control);
        let thread_name = name.clone();
        let max_batch = max_batch.max(1);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            log::debug!("Worker {} started", thread_name);
            loop {
                let first = match idle {
                    Some(idle) => match receiver.recv_timeout(idle) {
                        Ok(item) => item,
                        Err(RecvTimeoutError::Timeout) => {
                            handler(Vec::new(), &thread_control);
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    },
                    None => match receiver.recv() {
                        Ok(item) => item,
                        Err(_) => break,
                    },
                };
                let mut batch = vec![first];
                while batch.len() < max_batch {
                    match receiver.try_recv() {
                        Ok(item) => batch.push(item),
                        Err(_) => break,
                    }
                }
                handler(batch, &thread_control);
            }
            log::debug!("Worker {} stopped", thread_name);
        })?;
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            control,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue an item, blocking while the queue is full.
    pub fn submit(&self, item: T) -> Result<()> {
        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => sender
                .send(item)
                .map_err(|_| Error::invalid_state(format!("worker {} has exited", self.name))),
            None => Err(Error::invalid_state(format!("worker {} is stopped", self.name))),
        }
    }

    /// Queue an item unless the queue is full; the item is handed back if
    /// it could not be queued.
    pub fn try_submit(&self, item: T) -> std::result::Result<(), T> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => match sender.try_send(item) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(item)) | Err(TrySendError::Disconnected(item)) => Err(item),
            },
            None => Err(item),
        }
    }

    /// Close the queue. Queued items are still handled.
    pub fn stop(&self) {
        self.sender.lock().take();
    }

    /// Close the queue and tell the handler to abandon long work.
    pub fn cancel(&self) {
        self.control.cancel();
        self.stop();
    }

    /// Wait for the worker thread to exit.
    pub fn wait(&self) -> Result<()> {
        let handle = self.handle.lock().take();
        join_worker(&self.name, handle)
    }

    /// True once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}

impl<T: Send + 'static> std::fmt::Debug for QueuedWorker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedWorker").field("name", &self.name).finish()
    }
}

impl<T: Send + 'static> Drop for QueuedWorker<T> {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = self.wait() {
            log::error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn test_persistent_worker_runs_on_wake() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let worker = PersistentWorker::new("test-wake");
        let counter = Arc::clone(&rounds);
        worker
            .start(None, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while rounds.load(Ordering::SeqCst) < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        worker.wake();
        while rounds.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(rounds.load(Ordering::SeqCst) >= 2);

        worker.stop();
        worker.wait().unwrap();
        assert!(worker.is_cancelled());
    }

    #[test]
    fn test_persistent_worker_interval() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let worker = PersistentWorker::new("test-interval");
        let counter = Arc::clone(&rounds);
        worker
            .start(Some(Duration::from_millis(5)), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while rounds.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(rounds.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_double_start_is_error() {
        let worker = PersistentWorker::new("test-double");
        worker.start(None, |_| {}).unwrap();
        assert!(worker.start(None, |_| {}).is_err());
    }

    #[test]
    fn test_queued_worker_handles_everything_before_exit() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let worker = QueuedWorker::start("test-queue", 2, 8, move |batch: Vec<u32>, _| {
            sink.lock().extend(batch);
        })
        .unwrap();
        for i in 0..100 {
            worker.submit(i).unwrap();
        }
        worker.stop();
        worker.wait().unwrap();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
        assert!(worker.submit(100).is_err());
    }

    #[test]
    fn test_cancel_is_visible_to_handler() {
        let worker = QueuedWorker::start("test-cancel", 1, 1, |_: Vec<()>, control| {
            while !control.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
        worker.submit(()).unwrap();
        worker.cancel();
        worker.wait().unwrap();
        assert!(worker.is_cancelled());
    }

    #[test]
    fn test_idle_worker_calls_handler_without_items() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let worker = QueuedWorker::start_with_idle("test-idle", 1, 1, Some(Duration::from_millis(5)), move |batch: Vec<u32>, _| {
            sink.lock().push(batch.len());
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while calls.lock().iter().filter(|&&n| n == 0).count() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        worker.submit(7).unwrap();
        worker.stop();
        worker.wait().unwrap();

        let calls = calls.lock();
        assert!(calls.iter().filter(|&&n| n == 0).count() >= 2);
        assert_eq!(calls.iter().filter(|&&n| n == 1).count(), 1);
    }
}
