//! Single dedicated thread that owns a thread-affine execution target.
//!
//! Script runtimes may only be touched from the thread that created them.
//! [`ScriptDispatcher`] spawns that thread with a large stack, builds the
//! target there, and runs every submitted closure on it in FIFO order while
//! the submitting thread blocks for the result. Panics inside a closure are
//! caught on the worker and resumed on the caller, so the worker survives
//! and the caller sees the original payload.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Worker stack size: large enough for deeply recursive scripts.
pub const DEFAULT_STACK_SIZE: usize = if cfg!(target_pointer_width = "64") {
    16 * 1024 * 1024
} else {
    8 * 1024 * 1024
};

const STATE_IDLE: u8 = 0;
const STATE_PROCESSING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// What the worker thread is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Processing,
    Stopped,
}

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

struct ScriptTask<S> {
    id: u64,
    job: Job<S>,
}

/// `None` is the shutdown sentinel.
type Message<S> = Option<ScriptTask<S>>;

/// Serializes closures onto one worker thread that owns an `S`.
pub struct ScriptDispatcher<S: 'static> {
    sender: Sender<Message<S>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: ThreadId,
    state: Arc<AtomicU8>,
    next_task_id: AtomicU64,
    disposed: AtomicBool,
    name: String,
}

impl<S: 'static> std::fmt::Debug for ScriptDispatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptDispatcher")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl<S: 'static> ScriptDispatcher<S> {
    /// Spawn the worker thread and build the target on it with `init`.
    ///
    /// Blocks until `init` has run; its error is returned and the thread
    /// is joined.
    pub fn start<F>(name: &str, stack_size: usize, init: F) -> Result<Self>
    where
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        let (sender, receiver) = channel::unbounded::<Message<S>>();
        let (ready_tx, ready_rx) = channel::bounded::<Result<()>>(1);
        let state = Arc::new(AtomicU8::new(STATE_IDLE));
        let worker_state = Arc::clone(&state);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .stack_size(stack_size)
            .spawn(move || {
                let mut target = match init() {
                    Ok(target) => target,
                    Err(err) => {
                        worker_state.store(STATE_STOPPED, Ordering::Release);
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                run_worker(&mut target, &receiver, &worker_state);
                drop(target);
            })
            .map_err(|err| Error::EngineLoad(format!("failed to spawn script thread: {err}")))?;

        let worker_thread = handle.thread().id();
        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(Error::EngineLoad(
                "script thread exited during initialization".to_string(),
            ))
        });
        if let Err(err) = ready {
            if handle.join().is_err() {
                warn!(thread = name, "script thread panicked during initialization");
            }
            return Err(err);
        }

        debug!(thread = name, stack_size, "script dispatcher started");
        Ok(Self {
            sender,
            worker: Mutex::new(Some(handle)),
            worker_thread,
            state,
            next_task_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> DispatcherState {
        match self.state.load(Ordering::Acquire) {
            STATE_IDLE => DispatcherState::Idle,
            STATE_PROCESSING => DispatcherState::Processing,
            _ => DispatcherState::Stopped,
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether the calling thread is the worker thread.
    #[must_use]
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_thread
    }

    /// Run `f` on the worker thread and block until it returns.
    ///
    /// A panic inside `f` is resumed on the calling thread.
    pub fn invoke<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        if self.is_worker_thread() {
            return Err(Error::usage(
                "Re-entrant dispatch from the script thread is not supported",
            ));
        }

        let (done_tx, done_rx) = channel::bounded::<thread::Result<R>>(1);
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let task = ScriptTask {
            id,
            job: Box::new(move |target: &mut S| {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(target)));
                let _ = done_tx.send(outcome);
            }),
        };
        trace!(task = id, "task queued");
        self.sender.send(Some(task)).map_err(|_| Error::Disposed)?;

        match done_rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            // The worker dropped the task while shutting down.
            Err(_) => Err(Error::Disposed),
        }
    }

    /// [`invoke`](Self::invoke) for closures that themselves return a `Result`.
    pub fn invoke_fallible<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut S) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.invoke(f)?
    }

    /// Stop the worker after the task it is running (if any) and join it.
    /// Tasks still queued are dropped and their callers get
    /// [`Error::Disposed`]. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.send(None);
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if self.is_worker_thread() {
            warn!(thread = %self.name, "dispose called on the script thread; not joining");
            return;
        }
        if handle.join().is_err() {
            warn!(thread = %self.name, "script thread panicked during shutdown");
        }
        debug!(thread = %self.name, "script dispatcher stopped");
    }
}

impl<S: 'static> Drop for ScriptDispatcher<S> {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn run_worker<S>(target: &mut S, receiver: &Receiver<Message<S>>, state: &AtomicU8) {
    while let Ok(Some(task)) = receiver.recv() {
        state.store(STATE_PROCESSING, Ordering::Release);
        trace!(task = task.id, "task running");
        (task.job)(target);
        trace!(task = task.id, "task completed");
        state.store(STATE_IDLE, Ordering::Release);
    }
    state.store(STATE_STOPPED, Ordering::Release);
    let dropped = receiver.try_iter().filter(Option::is_some).count();
    if dropped > 0 {
        debug!(dropped, "dropped queued script tasks at shutdown");
    }
}
