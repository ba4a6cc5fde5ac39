//! A structured-concurrency scope that owns a set of child tasks and
//! guarantees they all reach a terminal state before the scope exits.

use std::collections::HashMap;
use std::error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;

/// The nursery's configured reaction to a child failure.
///
/// A failure in the scope body itself (the "main task") is never covered by
/// these: it always cancels every child and always surfaces at scope exit,
/// regardless of policy. Only *child* failures are governed by this table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Do nothing on a child failure; swallow it at scope release.
    IgnoreSilently,
    /// Cancel every other child on a child failure; swallow it at release.
    CancelSiblingsSilently,
    /// Do nothing on a child failure; raise it (wrapped) at scope release.
    IgnoreAndRaise,
    /// Cancel every other child on a child failure; raise it at release.
    CancelSiblingsAndRaise,
}

impl FailurePolicy {
    fn cancels_siblings(self) -> bool {
        matches!(
            self,
            FailurePolicy::CancelSiblingsSilently | FailurePolicy::CancelSiblingsAndRaise
        )
    }

    fn is_silent(self) -> bool {
        matches!(self, FailurePolicy::IgnoreSilently | FailurePolicy::CancelSiblingsSilently)
    }
}

/// An error surfaced at scope release.
#[derive(Debug)]
pub enum NurseryError<E> {
    /// The scope body itself failed; carries its error verbatim.
    MainTaskFailure(E),
    /// A child failed under a non-silent policy; names the child.
    ChildFailure { name: String, error: E },
    /// `start` was called twice with the same name in one nursery.
    DuplicateName(String),
}

impl<E: fmt::Debug> error::Error for NurseryError<E> {}

impl<E: fmt::Display> fmt::Display for NurseryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NurseryError::MainTaskFailure(e) => write!(f, "nursery main task failed: {e}"),
            NurseryError::ChildFailure { name, error } => {
                write!(f, "nursery child '{name}' failed: {error}")
            }
            NurseryError::DuplicateName(name) => write!(f, "duplicate nursery child name '{name}'"),
        }
    }
}

/// A handle to a task started in a [`Nursery`], returned by [`Nursery::start`]
/// and [`Nursery::get_task_by_name`].
#[derive(Clone)]
pub struct TaskHandle {
    name: String,
    abort: AbortHandle,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("name", &self.name).finish_non_exhaustive()
    }
}

impl TaskHandle {
    /// The task's name (as given to `start`, or auto-generated `task-N`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests cancellation of this task.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// `true` once the task has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

enum ChildOutcome<E> {
    Completed,
    Failed(E),
    Cancelled,
}

struct NamesState {
    next_id: u64,
    handles: HashMap<String, AbortHandle>,
}

struct NurseryInner<E> {
    names: Mutex<NamesState>,
    outcome_tx: mpsc::UnboundedSender<(String, ChildOutcome<E>)>,
    drained: Notify,
}

fn cancel_all<E>(inner: &NurseryInner<E>) {
    let names = inner.names.lock().unwrap();
    for abort in names.handles.values() {
        abort.abort();
    }
}

/// The scope handle passed to a nursery's body, and held by every child that
/// wants to start further tasks of its own.
///
/// Cheaply cloneable (an `Arc` handle); every clone refers to the same
/// nursery.
pub struct Nursery<E> {
    inner: Arc<NurseryInner<E>>,
}

impl<E> Clone for Nursery<E> {
    fn clone(&self) -> Self {
        Nursery {
            inner: self.inner.clone(),
        }
    }
}

impl<E> fmt::Debug for Nursery<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nursery").finish_non_exhaustive()
    }
}

impl<E: Send + 'static> Nursery<E> {
    /// Schedules `future` as a new child task, registering it under `name`
    /// (an auto-generated `task-N`, monotonic from 1, if omitted).
    ///
    /// Fails with [`NurseryError::DuplicateName`] if `name` is already in
    /// use by a live or not-yet-reaped child of this nursery.
    pub fn start<Fut>(&self, future: Fut, name: Option<String>) -> Result<TaskHandle, NurseryError<E>>
    where
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let mut names = self.inner.names.lock().unwrap();
        let name = match name {
            Some(name) => name,
            None => {
                let n = names.next_id;
                names.next_id += 1;
                format!("task-{n}")
            }
        };
        if names.handles.contains_key(&name) {
            return Err(NurseryError::DuplicateName(name));
        }

        let child = ChildTask {
            future: Box::pin(future),
            name: name.clone(),
            tx: self.inner.outcome_tx.clone(),
            reported: false,
        };
        let join = tokio::spawn(child);
        let abort = join.abort_handle();
        names.handles.insert(name.clone(), abort.clone());
        drop(names);

        tracing::info!(target: "nursery", task = %name, "child task started");
        Ok(TaskHandle { name, abort })
    }

    /// Looks up a previously started child by name. Returns `None` once the
    /// child has been reaped (any terminal state).
    pub fn get_task_by_name(&self, name: &str) -> Option<TaskHandle> {
        let names = self.inner.names.lock().unwrap();
        names.handles.get(name).map(|abort| TaskHandle {
            name: name.to_string(),
            abort: abort.clone(),
        })
    }
}

/// Wraps a child future so that, whichever way it ends — normal completion,
/// error, or cancellation via `Drop` (the task was aborted before it could
/// finish) — exactly one outcome is reported to the nursery's reaper.
struct ChildTask<E> {
    future: Pin<Box<dyn Future<Output = Result<(), E>> + Send>>,
    name: String,
    tx: mpsc::UnboundedSender<(String, ChildOutcome<E>)>,
    reported: bool,
}

impl<E: Send + 'static> Future for ChildTask<E> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.future.as_mut().poll(cx) {
            Poll::Ready(result) => {
                this.reported = true;
                let outcome = match result {
                    Ok(()) => ChildOutcome::Completed,
                    Err(e) => ChildOutcome::Failed(e),
                };
                let _ = this.tx.send((this.name.clone(), outcome));
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<E> Drop for ChildTask<E> {
    fn drop(&mut self) {
        if !self.reported {
            let _ = self.tx.send((self.name.clone(), ChildOutcome::Cancelled));
        }
    }
}

async fn run_reaper<E: Send + 'static>(
    inner: Arc<NurseryInner<E>>,
    mut rx: mpsc::UnboundedReceiver<(String, ChildOutcome<E>)>,
    policy: FailurePolicy,
    first_failure: Arc<Mutex<Option<(String, E)>>>,
) {
    while let Some((name, outcome)) = rx.recv().await {
        {
            let mut names = inner.names.lock().unwrap();
            names.handles.remove(&name);
        }
        match outcome {
            ChildOutcome::Failed(error) => {
                tracing::error!(target: "nursery", task = %name, "child task failed");
                let mut guard = first_failure.lock().unwrap();
                if guard.is_none() {
                    *guard = Some((name, error));
                }
                drop(guard);
                if policy.cancels_siblings() {
                    cancel_all(&inner);
                }
            }
            ChildOutcome::Cancelled => {
                tracing::debug!(target: "nursery", task = %name, "child task cancelled");
            }
            ChildOutcome::Completed => {
                tracing::debug!(target: "nursery", task = %name, "child task completed");
            }
        }
        inner.drained.notify_waiters();
    }
}

/// Runs `body` as the scope's main task, with `nursery` available to it for
/// starting children. Waits for every child to reach a terminal state
/// before returning, applying `policy`'s failure table along the way.
///
/// A failure from `body` itself always cancels every child and always
/// surfaces as [`NurseryError::MainTaskFailure`], independent of `policy` —
/// only a *child*'s failure is subject to the silent/raising distinction in
/// the failure table.
pub async fn scope<E, T, Fut>(policy: FailurePolicy, body: impl FnOnce(Nursery<E>) -> Fut) -> Result<T, NurseryError<E>>
where
    E: Send + 'static,
    T: Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let inner = Arc::new(NurseryInner {
        names: Mutex::new(NamesState {
            next_id: 1,
            handles: HashMap::new(),
        }),
        outcome_tx: tx,
        drained: Notify::new(),
    });
    let nursery = Nursery { inner: inner.clone() };
    let first_failure: Arc<Mutex<Option<(String, E)>>> = Arc::new(Mutex::new(None));

    let reaper = tokio::spawn(run_reaper(inner.clone(), rx, policy, first_failure.clone()));

    tracing::info!(target: "nursery", "scope opened");
    let body_result = body(nursery).await;

    if body_result.is_err() {
        tracing::error!(target: "nursery", "main task failed, cancelling children");
        cancel_all(&inner);
    }

    // Wait until every currently-known child has settled. A child started
    // by another child after this check began is swept up too: every
    // settlement removes its name and notifies us to recheck.
    loop {
        let notified = inner.drained.notified();
        let empty = inner.names.lock().unwrap().handles.is_empty();
        if empty {
            break;
        }
        notified.await;
    }

    reaper.abort();
    tracing::info!(target: "nursery", "scope closed");

    let value = match body_result {
        Ok(value) => value,
        Err(e) => return Err(NurseryError::MainTaskFailure(e)),
    };

    if policy.is_silent() {
        return Ok(value);
    }

    if let Some((name, error)) = first_failure.lock().unwrap().take() {
        return Err(NurseryError::ChildFailure { name, error });
    }

    Ok(value)
}
