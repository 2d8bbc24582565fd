use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::models::error::CaptureError;

/// Unit of work executed on the audio queue.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Shutdown,
}

/// Cloneable reference to a running `AudioQueue`.
#[derive(Clone)]
pub struct QueueHandle {
    tx: Sender<Message>,
    thread: ThreadId,
    label: Arc<str>,
}

impl QueueHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the caller is running on this queue.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Enqueue `job` and return immediately.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) -> Result<(), CaptureError> {
        self.tx
            .send(Message::Run(Box::new(job)))
            .map_err(|_| CaptureError::QueueUnavailable)
    }

    /// Run `job` on the queue and wait for its result.
    ///
    /// Runs inline when already on the queue, so nested calls from jobs
    /// or from the data callback never deadlock.
    pub fn dispatch_sync<R, F>(&self, job: F) -> Result<R, CaptureError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return Ok(job());
        }

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.dispatch(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(job));
            let _ = reply_tx.send(result);
        })?;

        match reply_rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(CaptureError::Unknown(format!("job on {} panicked", self.label))),
            // queue shut down before the job ran
            Err(_) => Err(CaptureError::QueueUnavailable),
        }
    }
}

/// Serial execution context owning all capture state mutation.
///
/// One named worker thread runs jobs in FIFO order. The same thread drains
/// an optional stream channel (converted audio from the real-time thread),
/// so stream items never run concurrently with jobs or with each other.
/// Jobs and stream items are not ordered relative to one another: when
/// both are ready the worker may pick either.
pub struct AudioQueue {
    handle: QueueHandle,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl AudioQueue {
    /// Spawn a queue that only runs jobs.
    pub fn spawn(label: &str) -> Result<Self, CaptureError> {
        Self::spawn_with_stream(label, crossbeam_channel::never::<()>(), |_| {})
    }

    /// Spawn a queue that also feeds every item of `stream` to `sink`.
    pub fn spawn_with_stream<T, F>(label: &str, stream: Receiver<T>, sink: F) -> Result<Self, CaptureError>
    where
        T: Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let (tx, rx) = unbounded::<Message>();
        let thread_label = label.to_string();
        let join = thread::Builder::new()
            .name(label.to_string())
            .spawn(move || run_loop(&thread_label, rx, stream, sink))
            .map_err(|e| CaptureError::Unknown(format!("failed to spawn {}: {}", label, e)))?;

        log::debug!("Audio queue {} started", label);
        Ok(Self {
            handle: QueueHandle {
                tx,
                thread: join.thread().id(),
                label: Arc::from(label),
            },
            join: Mutex::new(Some(join)),
        })
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    pub fn is_current(&self) -> bool {
        self.handle.is_current()
    }

    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) -> Result<(), CaptureError> {
        self.handle.dispatch(job)
    }

    pub fn dispatch_sync<R, F>(&self, job: F) -> Result<R, CaptureError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.handle.dispatch_sync(job)
    }

    /// Stop after the jobs already queued. Joins the worker unless called
    /// from it. Idempotent.
    pub fn shutdown(&self) {
        let Some(join) = self.join.lock().take() else {
            return;
        };
        let _ = self.handle.tx.send(Message::Shutdown);
        if self.is_current() {
            return;
        }
        if join.join().is_err() {
            log::error!("Audio queue {} worker panicked", self.handle.label);
        }
    }
}

impl Drop for AudioQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop<T, F>(label: &str, jobs: Receiver<Message>, mut stream: Receiver<T>, mut sink: F)
where
    F: FnMut(T),
{
    loop {
        let mut stream_closed = false;
        select! {
            recv(jobs) -> msg => match msg {
                Ok(Message::Run(job)) => {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        log::error!("Job on audio queue {} panicked", label);
                    }
                }
                Ok(Message::Shutdown) | Err(_) => break,
            },
            recv(stream) -> item => match item {
                Ok(item) => {
                    if panic::catch_unwind(AssertUnwindSafe(|| sink(item))).is_err() {
                        log::error!("Stream consumer on audio queue {} panicked", label);
                    }
                }
                Err(_) => stream_closed = true,
            },
        }
        if stream_closed {
            // producer side gone; keep serving jobs
            stream = crossbeam_channel::never();
        }
    }
    log::debug!("Audio queue {} stopped", label);
}
