//! A deadline branch for use inside a `select`.

use std::time::Duration;

use crate::channel::Channel;

/// Returns a fresh capacity-1 channel that fires once: after `delay`, a
/// sentinel `()` is pushed and the channel is closed.
///
/// Intended to be passed (via [`crate::select::r`]) as a deadline branch
/// alongside other receive actions in a `select` call.
pub fn timeout(delay: Duration) -> Channel<()> {
    let channel = Channel::new(1);
    let fired = channel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        fired.send_nowait(());
        fired.close();
    });
    channel
}
