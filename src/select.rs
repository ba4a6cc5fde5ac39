//! Multi-way guarded choice over prospective send/receive operations.
//!
//! `select` builds one ephemeral waiter per branch on its named channel,
//! awaits the first to succeed, cancels the rest, and invokes the winner's
//! callback (if any). Branch order is shuffled before enqueue so that, when
//! several branches become ready at once, the winner is uniformly random
//! over the tied set rather than always the first-listed branch.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::channel::{next_waiter_id, Channel, RecvOutcome, RecvSlot, SelectClaim};

/// A no-argument callback run only if its branch wins. Kept argument-free
/// (rather than handed the winning value) so invoking it never competes
/// with `select`'s own return value for ownership of that value — see
/// `Action::callback`.
pub type SelectCallback = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// The outcome of a winning `select`/`select_nowait` branch.
///
/// The `usize` in every variant is the winning branch's index into the
/// `actions` vector passed to `select`, not a channel identity comparison —
/// the engine already tracks which branch is which by position.
#[derive(Debug)]
pub enum SelectOutcome<T> {
    /// A receive branch won and produced a value.
    Received(usize, T),
    /// A receive branch won because its channel is closed and drained.
    ChannelClosed(usize),
    /// A send branch won; its item was delivered. The caller already owns
    /// (or constructed) the item, so it is not echoed back here.
    Sent(usize),
}

/// One branch of a `select`/`select_nowait` call, built by [`r`] or [`s`].
pub struct Action<T> {
    kind: ActionKind<T>,
    callback: Option<SelectCallback>,
}

impl<T> std::fmt::Debug for Action<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            ActionKind::Recv { .. } => "Recv",
            ActionKind::Send { .. } => "Send",
        };
        f.debug_struct("Action").field("kind", &kind).finish_non_exhaustive()
    }
}

enum ActionKind<T> {
    Recv { channel: Channel<T> },
    Send { channel: Channel<T>, item: T },
}

/// Builds a receive branch.
pub fn r<T: Send + 'static>(channel: &Channel<T>, callback: Option<SelectCallback>) -> Action<T> {
    Action {
        kind: ActionKind::Recv {
            channel: channel.clone(),
        },
        callback,
    }
}

/// Builds a send branch carrying `item`.
pub fn s<T: Send + 'static>(channel: &Channel<T>, item: T, callback: Option<SelectCallback>) -> Action<T> {
    Action {
        kind: ActionKind::Send {
            channel: channel.clone(),
            item,
        },
        callback,
    }
}

/// The shared one-shot completion slot every branch of one `select` call
/// races to write. First writer wins; later writes are no-ops.
struct Shared<T> {
    outcome: Mutex<Option<SelectOutcome<T>>>,
    notify: Notify,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Shared {
            outcome: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Attempts to write `outcome` as the winner. Returns `true` on success.
    fn try_complete(&self, outcome: SelectOutcome<T>) -> bool {
        let mut slot = self.outcome.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        drop(slot);
        self.notify.notify_waiters();
        true
    }

    fn is_resolved(&self) -> bool {
        self.outcome.lock().unwrap().is_some()
    }

    fn take(&self) -> Option<SelectOutcome<T>> {
        self.outcome.lock().unwrap().take()
    }
}

/// A receive branch's waiter: implements [`RecvSlot`] by racing to write its
/// `Received`/`ChannelClosed` outcome into the call's shared completion slot.
struct SelectRecvSlot<T> {
    id: u64,
    idx: usize,
    shared: Arc<Shared<T>>,
}

impl<T: Send> RecvSlot<T> for SelectRecvSlot<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_resolved(&self) -> bool {
        self.shared.is_resolved()
    }

    fn try_resolve(&self, value: T) -> Result<(), T> {
        let mut slot = self.shared.outcome.lock().unwrap();
        if slot.is_some() {
            return Err(value);
        }
        *slot = Some(SelectOutcome::Received(self.idx, value));
        drop(slot);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn resolve_closed(&self) {
        self.shared.try_complete(SelectOutcome::ChannelClosed(self.idx));
    }
}

/// A send branch's claim: wins the shared slot with `Sent(idx)` at the
/// moment the channel would otherwise commit the item.
struct SendClaim<T> {
    idx: usize,
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> SelectClaim for SendClaim<T> {
    fn try_claim(&self) -> bool {
        self.shared.try_complete(SelectOutcome::Sent(self.idx))
    }
}

/// Cancels a branch that did not win. Receive branches are deregistered
/// from their channel's waiter queue; send branches are aborted as tokio
/// tasks (whose `Drop`-based cleanup deregisters them the same way a
/// directly-cancelled `send` future would).
enum BranchGuard {
    Recv { channel_remove: Box<dyn FnOnce() + Send> },
    Send { abort: AbortHandle },
}

/// Chooses exactly one ready action among `actions`, completes it, cancels
/// every other branch, invokes the winner's callback (if any), and returns
/// the outcome.
pub async fn select<T: Send + 'static>(actions: Vec<Action<T>>) -> SelectOutcome<T> {
    let mut order: Vec<usize> = (0..actions.len()).collect();
    order.shuffle(&mut rand::thread_rng());

    let shared = Arc::new(Shared::new());
    let mut callbacks: Vec<Option<SelectCallback>> = Vec::with_capacity(actions.len());
    let mut kinds: Vec<Option<ActionKind<T>>> = Vec::with_capacity(actions.len());
    for action in actions {
        callbacks.push(action.callback);
        kinds.push(Some(action.kind));
    }

    let mut guards: Vec<BranchGuard> = Vec::with_capacity(kinds.len());

    for idx in order {
        let kind = kinds[idx].take().expect("each index visited once");
        match kind {
            ActionKind::Recv { channel } => {
                let id = next_waiter_id();
                let slot = Box::new(SelectRecvSlot {
                    id,
                    idx,
                    shared: shared.clone(),
                });
                channel.enqueue_receiver(slot);
                let channel = channel.clone();
                guards.push(BranchGuard::Recv {
                    channel_remove: Box::new(move || channel.remove_receiver(id)),
                });
            }
            ActionKind::Send { channel, item } => {
                let claim = Arc::new(SendClaim {
                    idx,
                    shared: shared.clone(),
                });
                let shared_for_close = shared.clone();
                let handle = tokio::spawn(async move {
                    // `send_selectable` only reaches `try_claim` on the path
                    // that would actually deliver. A channel that is already
                    // (or becomes) closed rejects the send without ever
                    // consulting the claim, so that outcome is reported here
                    // instead — mirroring a plain `select` receive branch's
                    // `resolve_closed`.
                    if !channel.send_selectable(item, claim).await {
                        shared_for_close.try_complete(SelectOutcome::ChannelClosed(idx));
                    }
                });
                guards.push(BranchGuard::Send {
                    abort: handle.abort_handle(),
                });
            }
        }
    }

    // Wait for the shared slot to resolve. Construct the `Notified` future
    // before checking the condition, per `tokio::sync::Notify`'s documented
    // race-free usage, so a `notify_waiters` call landing between the check
    // and the await can't be missed.
    loop {
        let notified = shared.notify.notified();
        if shared.is_resolved() {
            break;
        }
        notified.await;
    }

    for guard in guards {
        match guard {
            BranchGuard::Recv { channel_remove } => channel_remove(),
            BranchGuard::Send { abort } => abort.abort(),
        }
    }

    let outcome = shared.take().expect("resolved before breaking out of the wait loop");
    let winner_idx = match &outcome {
        SelectOutcome::Received(idx, _) => *idx,
        SelectOutcome::ChannelClosed(idx) => *idx,
        SelectOutcome::Sent(idx) => *idx,
    };
    if let Some(callback) = callbacks[winner_idx].take() {
        callback().await;
    }
    outcome
}

/// Non-suspending variant: shuffles the actions, tries each once in order,
/// and returns on the first that can complete immediately. Never suspends
/// itself — if the winning branch has a callback, it is handed to the
/// ambient tokio runtime as a detached task rather than awaited inline,
/// since awaiting it here would make a supposedly non-blocking call able to
/// suspend on arbitrary user code. Returns `None` if no branch was ready.
pub fn select_nowait<T: Send + 'static>(actions: Vec<Action<T>>) -> Option<SelectOutcome<T>> {
    let mut order: Vec<usize> = (0..actions.len()).collect();
    order.shuffle(&mut rand::thread_rng());

    let mut callbacks: Vec<Option<SelectCallback>> = Vec::with_capacity(actions.len());
    let mut kinds: Vec<Option<ActionKind<T>>> = Vec::with_capacity(actions.len());
    for action in actions {
        callbacks.push(action.callback);
        kinds.push(Some(action.kind));
    }

    for idx in order {
        let kind = kinds[idx].take().expect("each index visited once");
        let outcome = match kind {
            ActionKind::Recv { channel } => match channel.receive_nowait() {
                Some(RecvOutcome::Value(v)) => Some(SelectOutcome::Received(idx, v)),
                // An unbuffered, still-open channel reporting `Closed` from
                // `receive_nowait` without an actual close means "nothing
                // available right now" rather than "closed" — but this
                // crate's `receive_nowait` already narrows that case to
                // `None`, so any `Closed` seen here is a real close.
                Some(RecvOutcome::Closed) => Some(SelectOutcome::ChannelClosed(idx)),
                None => None,
            },
            ActionKind::Send { channel, item } => {
                if channel.send_nowait(item) {
                    Some(SelectOutcome::Sent(idx))
                } else if channel.is_closed() {
                    Some(SelectOutcome::ChannelClosed(idx))
                } else {
                    None
                }
            }
        };
        if let Some(outcome) = outcome {
            if let Some(callback) = callbacks[idx].take() {
                tokio::spawn(callback());
            }
            return Some(outcome);
        }
    }
    None
}
