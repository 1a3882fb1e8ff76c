//! Closure callbacks fed from broadcast channels.
//!
//! Scan sightings, connection events and data activity are all published on
//! `tokio::sync::broadcast` channels. A callback is a listener task draining
//! its own receiver; the [`CallbackHandle`] owns that task.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

/// Registration of a callback.
///
/// The callback runs for every event published after registration until the
/// handle is dropped or [`unregister`](CallbackHandle::unregister) is called.
/// A callback that falls behind the channel skips the oldest events.
pub struct CallbackHandle {
    id: u64,
    listener: Option<JoinHandle<()>>,
}

impl CallbackHandle {
    /// Spawn a listener calling `callback` for each event on `events`.
    ///
    /// `topic` names the event stream in lag warnings.
    pub(crate) fn listen<T, F>(
        id: u64,
        topic: &'static str,
        mut events: broadcast::Receiver<T>,
        callback: F,
    ) -> Self
    where
        T: Clone + Send + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let listener = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => callback(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Callback {} skipped {} {} events", id, skipped, topic);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            id,
            listener: Some(listener),
        }
    }

    /// Stop delivering events to this callback.
    pub fn unregister(mut self) {
        self.stop();
    }

    /// Registration id, unique per scanner or pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn stop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}
