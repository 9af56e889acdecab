use futures::prelude::*;
use std::pin::Pin;
use tokio::time;
use tracing::info;

pub use kube::runtime::watcher::{Event, Result};

/// Wraps a cluster watch stream that never terminates.
///
/// Disconnects are retried with a sleep that doubles up to a ceiling and
/// resets on the next successful event. `ready` reports whether the most
/// recent poll succeeded; the index folds it into its staleness state.
pub struct Watch<T> {
    ready: bool,
    backoff: time::Duration,
    rx: Pin<Box<dyn Stream<Item = Result<Event<T>>> + Send + 'static>>,
}

const RECONNECT_FLOOR: time::Duration = time::Duration::from_secs(1);
const RECONNECT_CEILING: time::Duration = time::Duration::from_secs(30);

// === impl Watch ===

impl<T, W> From<W> for Watch<T>
where
    W: Stream<Item = Result<Event<T>>> + Send + 'static,
{
    fn from(watch: W) -> Self {
        Watch {
            ready: false,
            backoff: RECONNECT_FLOOR,
            rx: watch.boxed(),
        }
    }
}

impl<T> Watch<T> {
    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Receive the next event in the stream.
    ///
    /// If the stream fails, log the error and back off before polling for a
    /// reset event. Reads against the index keep serving the last known
    /// state while this loops.
    pub async fn recv(&mut self) -> Event<T> {
        loop {
            match self
                .rx
                .next()
                .await
                .expect("watch stream must not terminate")
            {
                Ok(ev) => {
                    self.ready = true;
                    self.backoff = RECONNECT_FLOOR;
                    return ev;
                }
                Err(error) => {
                    self.ready = false;
                    info!(%error, "Disconnected");
                    time::sleep(self.backoff).await;
                    self.backoff = (self.backoff * 2).min(RECONNECT_CEILING);
                }
            }
        }
    }
}
