//! Channels, multi-way select, and structured-concurrency nurseries for
//! cooperative tasks.
//!
//! This crate gives single-threaded-style event-loop code — a FIFO
//! `Channel`, a fair multi-way `select` over prospective sends and
//! receives, and a `Nursery` that owns a scoped group of child tasks — a
//! concrete, preemptible realization on top of `tokio`: every channel's
//! state lives behind a `std::sync::Mutex`, and the `select` engine's
//! shared completion token is an atomic compare-and-set rather than a
//! single-threaded assumption, so the same contracts hold when senders,
//! receivers, and select calls race from different executor threads.
//!
//! # Example
//!
//! ```
//! use nursery_csp::Channel;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let channel = Channel::new(1);
//! let sender = channel.clone();
//! tokio::spawn(async move {
//!     sender.send("hello").await;
//! });
//! assert_eq!(channel.receive().await.value(), Some("hello"));
//! # }
//! ```
#![warn(missing_docs, missing_debug_implementations, unreachable_pub)]

mod channel;
mod nursery;
mod select;
mod timeout;

pub use channel::{Channel, RecvOutcome};
pub use nursery::{scope, FailurePolicy, Nursery, NurseryError, TaskHandle};
pub use select::{r, s, select, select_nowait, Action, SelectCallback, SelectOutcome};
pub use timeout::timeout;
