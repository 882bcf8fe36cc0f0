//! Bridges a transport event stream onto a channel.
//!
//! Reading from the stream inside the loop's `select!` would drop a
//! half-read notification whenever another branch wins. The forwarder owns
//! the stream in its own task, so the loop only ever polls a channel.

use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{DeviceEvent, EventStream, WatcherError};

/// Item delivered by the forwarder.
pub(crate) type WatchItem = Result<DeviceEvent, WatcherError>;

/// Notifications buffered between the watcher and the loop.
pub(crate) const EVENT_BUFFER: usize = 64;

/// Pumps `events` into `tx` until the stream fails or the receiver goes away.
///
/// The terminal error is forwarded before the task ends.
pub(crate) async fn forward_events<E>(mut events: E, tx: mpsc::Sender<WatchItem>)
where
    E: EventStream,
{
    loop {
        let item = events.next_event().await;
        let terminal = item.is_err();
        if let Ok(event) = &item {
            debug!(serial = event.serial(), ?event, "device event");
        }
        if tx.send(item).await.is_err() || terminal {
            break;
        }
    }
}
