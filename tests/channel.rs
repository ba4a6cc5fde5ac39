//! Covers buffered/unbuffered capacity semantics, close/drain ordering, and
//! idempotent close.

use std::time::Duration;

use nursery_csp::{Channel, RecvOutcome};

#[tokio::test]
async fn unbuffered_send_waits_for_a_receiver() {
    let ch = Channel::new(0);
    assert!(!ch.is_full()); // unbuffered: never holds anything, so never full

    let sender = ch.clone();
    let send_task = tokio::spawn(async move { sender.send(7).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!send_task.is_finished());

    assert_eq!(ch.receive().await, RecvOutcome::Value(7));
    assert!(send_task.await.unwrap());
}

#[tokio::test]
async fn unbuffered_channel_is_never_full_even_with_a_pending_sender() {
    let ch = Channel::new(0);
    let sender = ch.clone();
    let send_task = tokio::spawn(async move { sender.send(1).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A sender waiting with no receiver present does not make the channel
    // "full" — an unbuffered channel's buffer is always empty.
    assert!(!ch.is_full());

    send_task.abort();
}

#[tokio::test]
async fn buffered_send_nowait_respects_capacity() {
    let ch = Channel::new(2);
    assert!(!ch.is_full());
    assert!(ch.send_nowait(1));
    assert!(ch.send_nowait(2));
    assert!(ch.is_full());
    assert!(!ch.send_nowait(3));
    assert_eq!(ch.len(), 2);

    assert_eq!(ch.receive_nowait(), Some(RecvOutcome::Value(1)));
    assert_eq!(ch.receive_nowait(), Some(RecvOutcome::Value(2)));
    assert_eq!(ch.receive_nowait(), None);
    assert!(ch.is_empty());
}

#[tokio::test]
async fn close_rejects_pending_senders_but_drains_the_buffer_first() {
    let ch = Channel::new(1);
    assert!(ch.send_nowait(42));

    let sender = ch.clone();
    let send_task = tokio::spawn(async move { sender.send(99).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    ch.close();
    assert!(ch.is_closed());

    // The buffered item is still delivered after close.
    assert_eq!(ch.receive().await, RecvOutcome::Value(42));
    // The pending sender is rejected, never delivered.
    assert!(!send_task.await.unwrap());
    // Buffer is now drained and the channel is closed: every further
    // receive reports `Closed`, repeatably.
    assert_eq!(ch.receive().await, RecvOutcome::Closed);
    assert_eq!(ch.receive().await, RecvOutcome::Closed);
    assert_eq!(ch.receive_nowait(), Some(RecvOutcome::Closed));
}

#[tokio::test]
async fn close_is_idempotent() {
    let ch: Channel<i32> = Channel::new(1);
    ch.close();
    ch.close();
    ch.close();
    assert!(ch.is_closed());
    assert_eq!(ch.receive().await, RecvOutcome::Closed);
}

#[tokio::test]
async fn send_on_closed_channel_fails_immediately() {
    let ch = Channel::new(1);
    ch.close();
    assert!(!ch.send_nowait(1));
    assert!(!ch.send(1).await);
}

#[tokio::test]
async fn unbuffered_channel_hands_off_directly_without_buffering() {
    let ch = Channel::new(0);
    let receiver = ch.clone();
    let recv_task = tokio::spawn(async move { receiver.receive().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(ch.send_nowait(5));
    assert_eq!(recv_task.await.unwrap(), RecvOutcome::Value(5));
    assert_eq!(ch.len(), 0);
}

#[tokio::test]
async fn receivers_are_served_in_fifo_order() {
    let ch: Channel<i32> = Channel::new(0);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    for id in 0..3 {
        let receiver = ch.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let v = receiver.receive().await;
            tx.send((id, v)).unwrap();
        });
        // Stagger registration so queue order is deterministic.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for expected_id in 0..3 {
        assert!(ch.send_nowait(expected_id));
        let (id, v) = rx.recv().await.unwrap();
        assert_eq!(id, expected_id);
        assert_eq!(v, RecvOutcome::Value(expected_id));
    }
}
