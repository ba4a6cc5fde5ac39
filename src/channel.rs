//! A closeable, optionally-buffered FIFO channel between cooperative tasks.
//!
//! Sends and receives that cannot be satisfied immediately enqueue onto a
//! FIFO waiter queue and suspend; every mutation that could enable a
//! transfer between a sender, the buffer, and a receiver re-runs the
//! [`drive`] step so that no live waiter is ever stranded behind a waiter it
//! could have been matched against.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// The result of a successful (or not) non-suspending receive, and of a
/// suspending receive once it resolves.
///
/// This is the discriminated stand-in for the forbidden-null-sentinel
/// design described in the original source material: rather than reserving
/// a payload value to mean "closed", a receive reports which of the two it
/// got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome<T> {
    /// An item was received.
    Value(T),
    /// The channel is closed and its buffer has been drained.
    Closed,
}

impl<T> RecvOutcome<T> {
    /// Returns the received value, if any.
    pub fn value(self) -> Option<T> {
        match self {
            RecvOutcome::Value(v) => Some(v),
            RecvOutcome::Closed => None,
        }
    }

    /// Returns `true` if the channel was closed and drained.
    pub fn is_closed(&self) -> bool {
        matches!(self, RecvOutcome::Closed)
    }
}

/// Monotonic source of waiter ids, used so a dropped (cancelled) future can
/// remove exactly itself from a channel's waiter queue without relying on
/// fragile pointer comparisons between trait objects.
static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_waiter_id() -> u64 {
    NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed)
}

/// A slot a receiver-side waiter occupies in a channel's `receivers` queue.
///
/// Both a plain blocking [`Channel::receive`] and a branch of [`crate::select`]
/// are, from the channel's point of view, just something that can accept one
/// item or one close notification exactly once. Unifying them behind this
/// trait lets [`drive`] treat every receiver-side waiter uniformly, which is
/// the Rust encoding of the "shared external completion" design note in the
/// original specification.
pub(crate) trait RecvSlot<T>: Send {
    /// The waiter's unique id, used for queue removal on cancellation.
    fn id(&self) -> u64;

    /// Returns `true` if this waiter has already been resolved (by a direct
    /// wakeup, or because it is a select branch some other branch already
    /// won).
    fn is_resolved(&self) -> bool;

    /// Attempts to hand `value` to this waiter. On success the waiter is
    /// woken and this returns `Ok(())`. On failure (already resolved) the
    /// value is handed back so the caller can try the next waiter.
    fn try_resolve(&self, value: T) -> Result<(), T>;

    /// Notifies the waiter that the channel is closed and drained.
    /// No-op if already resolved.
    fn resolve_closed(&self);
}

/// A plain receiver waiter created by [`Channel::receive`].
struct RecvWaiter<T> {
    id: u64,
    slot: Mutex<RecvSlotState<T>>,
}

enum RecvSlotState<T> {
    Pending(Option<Waker>),
    Resolved(RecvOutcome<T>),
}

impl<T: Send> RecvSlot<T> for RecvWaiter<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_resolved(&self) -> bool {
        matches!(&*self.slot.lock().unwrap(), RecvSlotState::Resolved(_))
    }

    fn try_resolve(&self, value: T) -> Result<(), T> {
        let mut slot = self.slot.lock().unwrap();
        match &*slot {
            RecvSlotState::Resolved(_) => Err(value),
            RecvSlotState::Pending(waker) => {
                let waker = waker.clone();
                *slot = RecvSlotState::Resolved(RecvOutcome::Value(value));
                drop(slot);
                if let Some(w) = waker {
                    w.wake();
                }
                Ok(())
            }
        }
    }

    fn resolve_closed(&self) {
        let mut slot = self.slot.lock().unwrap();
        if let RecvSlotState::Pending(waker) = &*slot {
            let waker = waker.clone();
            *slot = RecvSlotState::Resolved(RecvOutcome::Closed);
            drop(slot);
            if let Some(w) = waker {
                w.wake();
            }
        }
    }
}

/// Forwarding impl so a shared `Arc<RecvWaiter<T>>` — held both by the
/// polling future and by the channel's `receivers` queue — can itself be
/// boxed as the trait object the queue stores.
impl<T: Send> RecvSlot<T> for Arc<RecvWaiter<T>> {
    fn id(&self) -> u64 {
        (**self).id()
    }

    fn is_resolved(&self) -> bool {
        (**self).is_resolved()
    }

    fn try_resolve(&self, value: T) -> Result<(), T> {
        (**self).try_resolve(value)
    }

    fn resolve_closed(&self) {
        (**self).resolve_closed()
    }
}

/// An external, one-shot acceptance gate a sender can be asked to check
/// before it is allowed to actually commit its item to a channel's buffer.
///
/// This is the Rust realization of the "channels accept an optional
/// external completion parameter on send" design note: a [`crate::select`]
/// send-branch gives its waiter a claim on the select call's shared
/// completion token, so that a send which becomes acceptable on one channel
/// at the same moment a different branch wins elsewhere in the same
/// `select()` call does not silently complete anyway. Ordinary
/// [`Channel::send`] callers never attach a claim.
pub(crate) trait SelectClaim: Send + Sync {
    /// Attempts to claim this waiter's outcome as the select call's winner.
    /// Returns `false` if some other branch already won, in which case the
    /// caller must not commit the transfer it was about to perform.
    fn try_claim(&self) -> bool;
}

/// A waiter occupying a slot in the `senders` queue: a blocking
/// [`Channel::send`] that could not be accepted immediately.
struct SendWaiter<T> {
    id: u64,
    slot: Mutex<SendSlotState<T>>,
}

enum SendSlotState<T> {
    /// Still carrying the item, optionally with a waker to call once
    /// acceptance becomes possible, and optionally gated by a select claim.
    Pending(Option<T>, Option<Waker>, Option<Arc<dyn SelectClaim>>),
    /// The handoff step has taken the item out of the waiter and appended it
    /// to the buffer; the sender future just needs waking to observe success.
    Accepted,
    /// The channel closed before this sender could be accepted.
    Rejected,
}

struct State<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    senders: VecDeque<Arc<SendWaiter<T>>>,
    receivers: VecDeque<Box<dyn RecvSlot<T>>>,
    closed: bool,
}

impl<T> State<T> {
    fn has_live_receiver(&self) -> bool {
        self.receivers.iter().any(|r| !r.is_resolved())
    }

    /// Whether a send can be accepted right now without suspension.
    fn can_send(&self) -> bool {
        if self.closed {
            return false;
        }
        if self.capacity == 0 {
            self.has_live_receiver() && self.buffer.is_empty()
        } else {
            self.buffer.len() < self.capacity
        }
    }
}

pub(crate) struct Inner<T> {
    state: Mutex<State<T>>,
}

impl<T: Send + 'static> Inner<T> {
    /// Attempts to move one pending sender's item into the buffer, honoring
    /// a select claim if present. A sender whose claim already lost
    /// elsewhere (or whose item was already taken) is dropped from the
    /// queue rather than requeued, since it has nothing left to contribute;
    /// the select engine will abort its helper task shortly regardless.
    /// Returns `true` if an item was moved.
    fn try_fill_buffer_from_senders(state: &mut State<T>) -> bool {
        while let Some(s) = state.senders.pop_front() {
            let mut slot = s.slot.lock().unwrap();
            if let SendSlotState::Pending(item, waker, claim) = &mut *slot {
                if item.is_none() {
                    continue;
                }
                if let Some(claim) = claim {
                    if !claim.try_claim() {
                        continue;
                    }
                }
                let item = item.take().expect("checked Some above");
                let waker = waker.take();
                *slot = SendSlotState::Accepted;
                drop(slot);
                state.buffer.push_back(item);
                if let Some(w) = waker {
                    w.wake();
                }
                state.senders.push_front(s);
                return true;
            }
        }
        false
    }

    /// Attempts to hand one buffered item to the oldest live receiver.
    /// Returns `true` if a transfer happened.
    fn try_deliver_one(state: &mut State<T>) -> bool {
        loop {
            let mut receiver = None;
            while let Some(r) = state.receivers.pop_front() {
                if !r.is_resolved() {
                    receiver = Some(r);
                    break;
                }
            }
            let receiver = match receiver {
                Some(r) => r,
                None => return false,
            };
            let item = match state.buffer.pop_front() {
                Some(item) => item,
                None => return false,
            };
            match receiver.try_resolve(item) {
                Ok(()) => return true,
                Err(item) => {
                    // The receiver was concurrently resolved — e.g. two
                    // `select` branches enqueued on the same channel share
                    // one completion token, and the other branch already
                    // claimed it. Push the item back and try the next live
                    // receiver.
                    state.buffer.push_front(item);
                    continue;
                }
            }
        }
    }

    /// The internal handoff step: repeatedly pulls a pending sender's item
    /// into the buffer (while there is room) and hands a buffered item to a
    /// live receiver (while both exist), until neither move is possible.
    /// Called after every mutation that could make a transfer possible.
    ///
    /// The two moves are independent steps rather than one combined
    /// "transfer and refill" operation: a sender can arrive before any
    /// receiver does (the ordinary unbuffered case) or a receiver can drain
    /// the buffer directly via [`Channel::receive_nowait`] without going
    /// through a receiver-side waiter at all, and in both cases a pending
    /// sender must still be picked up on the next call to `drive` rather
    /// than only as a side effect of a receiver-side transfer having just
    /// happened.
    fn drive(state: &mut State<T>) {
        loop {
            let mut progressed = false;
            if state.can_send() && Self::try_fill_buffer_from_senders(state) {
                progressed = true;
            }
            if !state.buffer.is_empty() && state.has_live_receiver() && Self::try_deliver_one(state) {
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        if state.closed && state.buffer.is_empty() {
            while let Some(r) = state.receivers.pop_front() {
                if !r.is_resolved() {
                    r.resolve_closed();
                }
            }
        }
    }
}

/// A typed, optionally-buffered, closeable rendezvous point between
/// cooperative tasks.
///
/// `Channel` is cheaply cloneable (it is an `Arc` handle); every clone refers
/// to the same underlying queue.
pub struct Channel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Channel<T> {
    /// Creates a new channel. `capacity == 0` means unbuffered (rendezvous);
    /// `capacity > 0` means a bounded buffer of that size.
    pub fn new(capacity: usize) -> Self {
        Channel {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    capacity,
                    buffer: VecDeque::new(),
                    senders: VecDeque::new(),
                    receivers: VecDeque::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// The configured capacity (`0` for an unbuffered channel).
    pub fn capacity(&self) -> usize {
        self.inner.state.lock().unwrap().capacity
    }

    /// The number of items currently buffered.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().buffer.len()
    }

    /// `true` if the buffer holds no items. An unbuffered channel is always
    /// empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` if the buffer currently holds `capacity` items. An unbuffered
    /// channel never buffers anything (a successful unbuffered send hands
    /// off to a receiver directly rather than sitting in the buffer), so it
    /// is always `false`.
    pub fn is_full(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        if state.capacity == 0 {
            !state.buffer.is_empty()
        } else {
            state.buffer.len() >= state.capacity
        }
    }

    /// `true` once [`Channel::close`] has been called (idempotent, sticky).
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    /// Closes the channel. Idempotent.
    ///
    /// Every enqueued sender is rejected (its blocking `send` resolves to
    /// `false`). If the buffer is currently empty, every enqueued receiver
    /// is resolved to [`RecvOutcome::Closed`]; otherwise receivers keep
    /// draining the buffer and only see `Closed` once it runs dry.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        tracing::debug!(target: "channel", "channel closed");

        for s in state.senders.drain(..) {
            let mut slot = s.slot.lock().unwrap();
            if matches!(&*slot, SendSlotState::Pending(_, _, _)) {
                let waker = match std::mem::replace(&mut *slot, SendSlotState::Rejected) {
                    SendSlotState::Pending(_, waker, _) => waker,
                    _ => unreachable!(),
                };
                drop(slot);
                if let Some(w) = waker {
                    w.wake();
                }
            }
        }

        Inner::drive(&mut state);
    }

    /// Attempts to send without suspension.
    ///
    /// Succeeds iff the channel is open and can currently accept an item
    /// (not full; for unbuffered channels, a live receiver must already be
    /// waiting). Never suspends.
    pub fn send_nowait(&self, item: T) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if !state.can_send() {
            return false;
        }
        state.buffer.push_back(item);
        Inner::drive(&mut state);
        true
    }

    /// Sends `item`, suspending as needed until the channel accepts it or is
    /// closed.
    ///
    /// Returns `true` if delivered, `false` if the channel was (or became)
    /// closed before delivery.
    pub async fn send(&self, item: T) -> bool {
        SendFuture {
            channel: self,
            waiter: None,
            item: Some(item),
            claim: None,
        }
        .await
    }

    /// Sends `item`, but only commits the delivery if `claim` is won at the
    /// moment the channel would otherwise accept it.
    ///
    /// Used by a `select()` send-branch so that "this branch would deliver
    /// now" and "this branch has won the select" are settled atomically
    /// under the channel's own lock — otherwise a losing branch could
    /// complete its handoff before the select engine cancels it.
    pub(crate) async fn send_selectable(&self, item: T, claim: Arc<dyn SelectClaim>) -> bool {
        SendFuture {
            channel: self,
            waiter: None,
            item: Some(item),
            claim: Some(claim),
        }
        .await
    }

    /// Attempts to receive without suspension.
    ///
    /// Returns `None` if nothing is available yet (would-block) — this is
    /// distinct from the channel being closed and drained, which is
    /// reported as `Some(RecvOutcome::Closed)`.
    pub fn receive_nowait(&self) -> Option<RecvOutcome<T>> {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(item) = state.buffer.pop_front() {
            Inner::drive(&mut state);
            return Some(RecvOutcome::Value(item));
        }
        if state.closed {
            return Some(RecvOutcome::Closed);
        }
        None
    }

    /// Receives the next item in FIFO order, or [`RecvOutcome::Closed`] once
    /// the channel is closed and its buffer has been drained. Always
    /// suspends at least once.
    pub async fn receive(&self) -> RecvOutcome<T> {
        RecvFuture {
            channel: self,
            waiter: None,
        }
        .await
    }

    pub(crate) fn enqueue_receiver(&self, slot: Box<dyn RecvSlot<T>>) {
        let mut state = self.inner.state.lock().unwrap();
        state.receivers.push_back(slot);
        Inner::drive(&mut state);
    }

    pub(crate) fn remove_receiver(&self, id: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.receivers.retain(|r| r.id() != id);
    }

    /// Detaches a sender waiter from the queue, either because it was
    /// cancelled while still pending, or because the handoff step already
    /// settled it (accepted or rejected) and it is done being tracked.
    ///
    /// Unlike a cancelled receiver, a detached sender never needs to forward
    /// a wakeup: in this implementation the handoff step itself moves a
    /// woken sender's item into the buffer under the same lock that frees
    /// the slot, so "woken" and "delivered" happen atomically together —
    /// there is no half-granted state that could strand a slot.
    pub(crate) fn remove_sender(&self, id: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.senders.retain(|s| s.id != id);
        Inner::drive(&mut state);
    }
}

/// The future returned by [`Channel::send`].
///
/// When `claim` is set (only for select send-branches, via
/// [`Channel::send_selectable`]), every point that would otherwise commit
/// the item to the buffer first calls [`SelectClaim::try_claim`]; on
/// failure the commit is skipped and the future just keeps waiting, since
/// losing select branches are cancelled shortly by the engine regardless.
struct SendFuture<'a, T> {
    channel: &'a Channel<T>,
    waiter: Option<Arc<SendWaiter<T>>>,
    item: Option<T>,
    claim: Option<Arc<dyn SelectClaim>>,
}

impl<'a, T: Send + 'static> Future for SendFuture<'a, T> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.channel.inner.state.lock().unwrap();

        if let Some(waiter) = this.waiter.take() {
            let mut slot = waiter.slot.lock().unwrap();
            match &mut *slot {
                SendSlotState::Rejected => {
                    drop(slot);
                    state.senders.retain(|s| s.id != waiter.id);
                    return Poll::Ready(false);
                }
                SendSlotState::Accepted => {
                    drop(slot);
                    state.senders.retain(|s| s.id != waiter.id);
                    return Poll::Ready(true);
                }
                SendSlotState::Pending(item, waker, claim) => {
                    if state.can_send() {
                        if let Some(claim) = claim {
                            if !claim.try_claim() {
                                *waker = Some(cx.waker().clone());
                                drop(slot);
                                this.waiter = Some(waiter);
                                return Poll::Pending;
                            }
                        }
                        let item = item.take().expect("pending sender always holds its item");
                        *slot = SendSlotState::Accepted;
                        drop(slot);
                        state.senders.retain(|s| s.id != waiter.id);
                        state.buffer.push_back(item);
                        Inner::drive(&mut state);
                        return Poll::Ready(true);
                    }
                    if state.closed {
                        *slot = SendSlotState::Rejected;
                        drop(slot);
                        state.senders.retain(|s| s.id != waiter.id);
                        return Poll::Ready(false);
                    }
                    *waker = Some(cx.waker().clone());
                    drop(slot);
                    this.waiter = Some(waiter);
                    return Poll::Pending;
                }
            }
        }

        // First poll: try the fast path before enqueuing.
        if state.closed {
            return Poll::Ready(false);
        }
        if state.can_send() && this.claim.as_ref().map_or(true, |c| c.try_claim()) {
            let item = this.item.take().expect("item present on first poll");
            state.buffer.push_back(item);
            Inner::drive(&mut state);
            return Poll::Ready(true);
        }

        let waiter = Arc::new(SendWaiter {
            id: next_waiter_id(),
            slot: Mutex::new(SendSlotState::Pending(
                this.item.take(),
                Some(cx.waker().clone()),
                this.claim.clone(),
            )),
        });
        state.senders.push_back(waiter.clone());
        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl<'a, T> Drop for SendFuture<'a, T> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            self.channel.remove_sender(waiter.id);
        }
    }
}

/// The future returned by [`Channel::receive`].
struct RecvFuture<'a, T> {
    channel: &'a Channel<T>,
    waiter: Option<Arc<RecvWaiter<T>>>,
}

impl<'a, T: Send + 'static> Future for RecvFuture<'a, T> {
    type Output = RecvOutcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(waiter) = this.waiter.take() {
            let mut slot = waiter.slot.lock().unwrap();
            match &mut *slot {
                RecvSlotState::Resolved(_) => {
                    let resolved = std::mem::replace(
                        &mut *slot,
                        RecvSlotState::Resolved(RecvOutcome::Closed),
                    );
                    drop(slot);
                    this.channel.remove_receiver(waiter.id);
                    match resolved {
                        RecvSlotState::Resolved(outcome) => return Poll::Ready(outcome),
                        _ => unreachable!(),
                    }
                }
                RecvSlotState::Pending(waker) => {
                    *waker = Some(cx.waker().clone());
                    drop(slot);
                    this.waiter = Some(waiter);
                    return Poll::Pending;
                }
            }
        }

        let waiter = Arc::new(RecvWaiter {
            id: next_waiter_id(),
            slot: Mutex::new(RecvSlotState::Pending(Some(cx.waker().clone()))),
        });
        this.channel
            .enqueue_receiver(Box::new(waiter.clone()) as Box<dyn RecvSlot<T>>);

        // The enqueue above may have resolved the waiter synchronously via
        // `drive`; re-check before registering as pending.
        let resolved = {
            let slot = waiter.slot.lock().unwrap();
            matches!(&*slot, RecvSlotState::Resolved(_))
        };
        this.waiter = Some(waiter.clone());
        if resolved {
            return Pin::new(this).poll(cx);
        }
        Poll::Pending
    }
}

impl<'a, T> Drop for RecvFuture<'a, T> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            self.channel.remove_receiver(waiter.id);
        }
    }
}
