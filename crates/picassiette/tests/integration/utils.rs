use std::sync::Arc;
use std::time::Duration;

use picassiette::{Target, TargetHandle};
use tokio::sync::mpsc;

pub use picassiette_test as test;

/// A [`Target`] that forwards every delivery into a channel.
pub struct ChannelTarget<P> {
    handle: TargetHandle,
    sender: mpsc::UnboundedSender<Option<P>>,
}

impl<P: Send + Sync + 'static> Target<P> for ChannelTarget<P> {
    fn handle(&self) -> &TargetHandle {
        &self.handle
    }

    fn on_receive(&self, value: Option<P>) {
        // the test may have stopped listening
        let _ = self.sender.send(value);
    }
}

/// Creates a [`ChannelTarget`] and the receiving end of its deliveries.
pub fn channel_target<P>() -> (Arc<ChannelTarget<P>>, mpsc::UnboundedReceiver<Option<P>>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let target = ChannelTarget {
        handle: TargetHandle::new(),
        sender,
    };
    (Arc::new(target), receiver)
}

/// Waits for the next delivery.
///
/// # Panics
///
/// Panics if nothing is delivered in time.
pub async fn next_delivery<P>(receiver: &mut mpsc::UnboundedReceiver<Option<P>>) -> Option<P> {
    tokio::time::timeout(Duration::from_secs(10), receiver.recv())
        .await
        .expect("no delivery in time")
        .expect("target was dropped")
}
