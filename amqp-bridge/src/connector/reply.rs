//! Waiting for the replies of the published request messages.
//!
//! All the replies arrive to one exclusive reply queue, they are matched to the requests by
//! correlation id. Both the queue and its consumer are created on first use.

use crate::bridge_error;
use crate::broker::{Broker, DeliveryStream, PublishProperties};
use crate::error::BridgeError;
use anyhow::{anyhow, Result};
use futures::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, OnceCell};
use tokio::time::Instant;

type PendingReplies = HashMap<String, oneshot::Sender<()>>;

pub struct ReplyCorrelator {
    broker: Arc<dyn Broker>,
    pending: Arc<Mutex<PendingReplies>>,
    queue: OnceCell<String>,
    consumer: OnceCell<()>,
    consumer_tag: Mutex<Option<String>>,
}

fn lock(pending: &Mutex<PendingReplies>) -> MutexGuard<'_, PendingReplies> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ReplyCorrelator {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        ReplyCorrelator {
            broker,
            pending: Arc::new(Mutex::new(HashMap::new())),
            queue: OnceCell::new(),
            consumer: OnceCell::new(),
            consumer_tag: Mutex::new(None),
        }
    }

    /// Name of the reply queue, it is declared by the first call.
    pub async fn reply_queue(&self) -> Result<String> {
        let queue = self
            .queue
            .get_or_try_init(|| async {
                let queue = self.broker.assert_exclusive_queue().await?;
                debug!("Declared reply queue {}", queue);

                Ok::<String, anyhow::Error>(queue)
            })
            .await?;

        Ok(queue.clone())
    }

    /// Register a request which is about to be published with `properties`. The reply consumer is
    /// started if it doesn't run yet.
    pub async fn await_reply(&self, properties: &PublishProperties) -> Result<PendingReply> {
        let (Some(reply_to), Some(correlation_id)) = (&properties.reply_to, &properties.correlation_id) else {
            return bridge_error!(BridgeError::MissingReplyRouting);
        };

        self.consumer
            .get_or_try_init(|| async {
                let consumer = self.broker.consume(reply_to, true).await?;

                debug!("Consuming replies from {} with tag {}", reply_to, consumer.consumer_tag);

                *self.consumer_tag.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(consumer.consumer_tag);

                tokio::spawn(dispatch_replies(consumer.deliveries, self.pending.clone()));

                Ok::<(), anyhow::Error>(())
            })
            .await?;

        debug!("Setting up reply listener for message: {}", correlation_id);

        let (sender, receiver) = oneshot::channel();
        let count = {
            let mut pending = lock(&self.pending);
            pending.insert(correlation_id.clone(), sender);
            pending.len()
        };

        debug!("Awaiting for {} replies", count);

        Ok(PendingReply {
            correlation_id: correlation_id.clone(),
            receiver: Some(receiver),
            pending: self.pending.clone(),
            registered_at: Instant::now(),
        })
    }

    /// Take the tag of the reply consumer for cancelling it.
    pub fn take_consumer_tag(&self) -> Option<String> {
        self.consumer_tag
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        lock(&self.pending).contains_key(correlation_id)
    }
}

async fn dispatch_replies(mut deliveries: DeliveryStream, pending: Arc<Mutex<PendingReplies>>) {
    while let Some(delivery) = deliveries.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!("Consuming replies failed {:?}", e);
                break;
            }
        };

        let correlation_id = delivery.correlation_id.unwrap_or_default();
        let sender = lock(&pending).remove(&correlation_id);

        match sender {
            Some(sender) => {
                info!("Received reply for message: {}", correlation_id);

                // the receiver can be dropped right now by a timeout
                let _ = sender.send(());
            }
            None => warn!("Received reply for unknown message: {}", correlation_id),
        }
    }

    debug!("Reply consumer ended");
}

/// A request waiting for its reply. Dropping it removes the request from the registry.
pub struct PendingReply {
    correlation_id: String,
    receiver: Option<oneshot::Receiver<()>>,
    pending: Arc<Mutex<PendingReplies>>,
    registered_at: Instant,
}

impl PendingReply {
    /// Wait for the reply. The timeout is counted from the registration of the request, `None`
    /// waits forever.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<()> {
        let receiver = self
            .receiver
            .take()
            .ok_or_else(|| anyhow!("Reply of {} is already awaited", self.correlation_id))?;

        let received = match timeout {
            Some(timeout) => match tokio::time::timeout_at(self.registered_at + timeout, receiver).await {
                Ok(received) => received,
                Err(_) => return bridge_error!(BridgeError::ReplyTimeout(timeout)),
            },
            None => receiver.await,
        };

        received.map_err(|_| anyhow!("Reply listener of {} is gone", self.correlation_id))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        let count = {
            let mut pending = lock(&self.pending);
            pending.remove(&self.correlation_id);
            pending.len()
        };

        debug!("Awaiting for further {} replies", count);
    }
}
