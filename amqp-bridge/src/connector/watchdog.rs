//! Periodic check of the consumed queue.
//!
//! The queue can disappear while we consume it, for example when somebody deletes it. In that
//! case the broker doesn't always tell the consumer, so the queue is checked periodically and the
//! connector is drained when it is gone.

use super::{Connector, Phase};
use log::{debug, error};
use std::time::Duration;

impl Connector {
    /// Start the watchdog of the queue from the beginning, the previous one is stopped.
    pub(crate) fn rearm_watchdog(&self, queue: &str, period: Duration) {
        let mut state = self.state();

        if let Some(previous) = state.watchdog.take() {
            previous.abort();
        }

        // closing has already stopped the watchdog
        if state.phase == Phase::Closed || state.close.is_some() {
            return;
        }

        let connector = self.clone();
        let queue = queue.to_owned();

        state.watchdog = Some(tokio::spawn(async move {
            connector.watch_queue(queue, period).await;
        }));
    }

    async fn watch_queue(&self, queue: String, period: Duration) {
        loop {
            tokio::time::sleep(period).await;

            debug!("Queue watchdog checking: {}", queue);

            if let Err(e) = self.inner.broker.check_queue(&queue).await {
                error!("Queue watchdog failed {:?}", e);

                // draining aborts this task, so it runs in its own
                let connector = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = connector.drain().await {
                        (connector.inner.on_error)(e);
                    }
                });

                return;
            }
        }
    }
}
