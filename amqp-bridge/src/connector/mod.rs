//! The connector owns the broker connection, runs the consumer and publishes messages.
//!
//! A connector has at most one consumer. The life of the consumer is
//! `Idle -> Consuming -> Draining -> Closed`: draining starts when a message handler fails (if
//! the consumer is configured to close on errors), when a termination signal arrives or when the
//! consumed queue disappears. During draining the consumers are cancelled and the connection is
//! closed once the last message being processed is acked or nacked.

pub mod reply;
pub mod watchdog;

use crate::bridge_error;
use crate::broker::amqp::AmqpBroker;
use crate::broker::{Broker, Delivery, DeliveryStream, ErrorCallback, PublishProperties};
use crate::config::{
    BrokerConfig, ConsumeConfig, ExchangeConsumeConfig, PublishConfig, QueueConsumeConfig,
};
use crate::error::{as_process_error, BridgeError};
use crate::signal::{InterceptedSignal, SignalRegistry};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use log::{debug, error, info, warn};
use reply::ReplyCorrelator;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handles one delivered message. Returning an error nacks the message.
pub type MessageHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Outcome of a memoized operation, every caller gets a clone of the same result.
type SharedOutcome = Shared<BoxFuture<'static, std::result::Result<(), Arc<anyhow::Error>>>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Consuming,
    Draining,
    Closed,
}

struct State {
    phase: Phase,
    consumer_tag: Option<String>,
    /// Number of messages being processed at the moment.
    in_flight: usize,
    watchdog: Option<JoinHandle<()>>,
    signal_listener: Option<JoinHandle<()>>,
    abort: Option<SharedOutcome>,
    close: Option<SharedOutcome>,
}

struct Inner {
    broker: Arc<dyn Broker>,
    signals: SignalRegistry,
    on_error: ErrorCallback,
    replies: ReplyCorrelator,
    state: Mutex<State>,
    closed: watch::Sender<bool>,
}

/// Handle of the bridge between the broker and the message handlers. Clones share the same
/// connection and state.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

impl Connector {
    /// Connect to the broker. `on_error` gets the connection errors which happen after the
    /// connection is established and the errors which cannot be returned to any caller.
    pub async fn connect(
        config: &BrokerConfig,
        signals: SignalRegistry,
        on_error: ErrorCallback,
    ) -> Result<Connector> {
        let broker = AmqpBroker::connect(config, on_error.clone()).await?;

        Ok(Connector::new(Arc::new(broker), signals, on_error))
    }

    pub fn new(broker: Arc<dyn Broker>, signals: SignalRegistry, on_error: ErrorCallback) -> Connector {
        let (closed, _) = watch::channel(false);

        Connector {
            inner: Arc::new(Inner {
                replies: ReplyCorrelator::new(broker.clone()),
                broker,
                signals,
                on_error,
                state: Mutex::new(State {
                    phase: Phase::Idle,
                    consumer_tag: None,
                    in_flight: 0,
                    watchdog: None,
                    signal_listener: None,
                    abort: None,
                    close: None,
                }),
                closed,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    /// Number of messages being processed.
    pub fn in_flight(&self) -> usize {
        self.state().in_flight
    }

    /// Number of published requests waiting for their replies.
    pub fn pending_replies(&self) -> usize {
        self.inner.replies.pending_count()
    }

    fn is_draining(&self) -> bool {
        matches!(self.phase(), Phase::Draining | Phase::Closed)
    }

    /// Resolves when the connector is closed.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();

        // the sender lives as long as the connector, so this cannot fail
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Start consuming messages of an existing queue. The messages are processed in the
    /// background, use [`Connector::closed`] to wait for the end of consuming.
    pub async fn consume_from_queue(
        &self,
        config: &QueueConsumeConfig,
        handler: MessageHandler,
    ) -> Result<()> {
        self.start_consuming()?;

        let result = self.consume(&config.queue, &config.consume, handler).await;

        self.revert_on_error(result)
    }

    /// Declare an exclusive queue, bind it to the exchange with the routing key and start
    /// consuming it.
    pub async fn consume_commands_from_exchange(
        &self,
        config: &ExchangeConsumeConfig,
        handler: MessageHandler,
    ) -> Result<()> {
        self.start_consuming()?;

        let result = async {
            let queue = self.inner.broker.assert_exclusive_queue().await?;

            debug!(
                "Binding queue {} to exchange {} with routing key {}",
                queue, config.exchange, config.routing_key
            );

            self.inner
                .broker
                .bind_queue(&queue, &config.exchange, &config.routing_key)
                .await?;

            self.consume(&queue, &config.consume, handler).await
        }
        .await;

        self.revert_on_error(result)
    }

    fn start_consuming(&self) -> Result<()> {
        let mut state = self.state();

        match state.phase {
            Phase::Idle => {
                state.phase = Phase::Consuming;

                Ok(())
            }
            Phase::Consuming => bridge_error!(BridgeError::ConsumerAlreadyStarted),
            Phase::Draining | Phase::Closed => bridge_error!(BridgeError::ConnectorClosed),
        }
    }

    fn revert_on_error(&self, result: Result<()>) -> Result<()> {
        if result.is_err() {
            let mut state = self.state();

            if state.phase == Phase::Consuming && state.consumer_tag.is_none() {
                state.phase = Phase::Idle;
            }
        }

        result
    }

    async fn consume(&self, queue: &str, config: &ConsumeConfig, handler: MessageHandler) -> Result<()> {
        self.inner.broker.prefetch(config.prefetch).await?;
        debug!("Prefetch is set to {}", config.prefetch);
        info!("Starting consuming messages from queue {}", queue);

        let consumer = self.inner.broker.consume(queue, false).await?;

        let draining = {
            let mut state = self.state();

            if state.phase == Phase::Consuming {
                state.consumer_tag = Some(consumer.consumer_tag.clone());
                false
            } else {
                true
            }
        };

        if draining {
            warn!("Connector is closing, cancel the consumer of queue {}", queue);
            self.inner.broker.cancel(&consumer.consumer_tag).await?;

            return Ok(());
        }

        self.setup_signal_listener();
        self.rearm_watchdog(queue, config.watchdog_period);
        self.spawn_delivery_loop(
            queue.to_owned(),
            config.clone(),
            consumer.deliveries,
            handler,
        );

        Ok(())
    }

    fn spawn_delivery_loop(
        &self,
        queue: String,
        config: ConsumeConfig,
        mut deliveries: DeliveryStream,
        handler: MessageHandler,
    ) {
        let connector = self.clone();

        tokio::spawn(async move {
            while let Some(delivery) = deliveries.next().await {
                match delivery {
                    Ok(delivery) => {
                        let in_flight = connector.message_started();
                        debug!("Messages being consumed: {}", in_flight);

                        connector.rearm_watchdog(&queue, config.watchdog_period);

                        let connector = connector.clone();
                        let handler = handler.clone();
                        let close_on_error = config.close_on_consumer_error;

                        tokio::spawn(async move {
                            connector.process_delivery(delivery, handler, close_on_error).await;
                        });
                    }
                    Err(e) => {
                        error!("Consuming queue {} failed {:?}", queue, e);

                        if let Err(e) = connector.drain().await {
                            error!("Cannot close after consumer failure {:?}", e);
                        }

                        break;
                    }
                }
            }

            debug!("Consumer of queue {} ended", queue);
        });
    }

    fn message_started(&self) -> usize {
        let mut state = self.state();
        state.in_flight += 1;
        state.in_flight
    }

    fn message_finished(&self) -> usize {
        let mut state = self.state();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.in_flight
    }

    async fn process_delivery(&self, delivery: Delivery, handler: MessageHandler, close_on_error: bool) {
        let id = format!("[message {}]", delivery.message_id.as_deref().unwrap_or("-"));
        let delivery_tag = delivery.delivery_tag;
        let reply_to = delivery.reply_to.clone();
        let correlation_id = delivery.correlation_id.clone();

        let result = if self.is_draining() {
            bridge_error!(BridgeError::Draining)
        } else {
            handler(delivery).await
        };

        match result {
            Ok(()) => {
                debug!("{} ack-ing message", id);

                if let Err(e) = self.inner.broker.ack(delivery_tag).await {
                    warn!("{} Failed to ack the message {:?}", id, e);
                } else if let Some(reply_to) = reply_to {
                    debug!(
                        "{} Message reply requested reply_to={} correlation_id={:?}",
                        id, reply_to, correlation_id
                    );

                    let properties = PublishProperties {
                        correlation_id,
                        ..Default::default()
                    };

                    if let Err(e) = self
                        .inner
                        .broker
                        .publish("", &reply_to, Bytes::new(), properties)
                        .await
                    {
                        warn!("{} Failed to send reply to {} {:?}", id, reply_to, e);
                    }
                }
            }
            Err(e) => {
                // process errors are logged by the process runner
                if as_process_error(&e).is_none() {
                    error!("{} {:#}", id, e);
                }

                if close_on_error && !self.is_draining() {
                    warn!("Closing after all current messages are processed");

                    if let Err(e) = self.abort_consumers().await {
                        error!("Cannot cancel consumers {:?}", e);
                    }
                }

                info!("{} nAck-ing the message back to broker", id);

                if let Err(e) = self.inner.broker.nack(delivery_tag).await {
                    warn!(
                        "{} Failed to nAck the message back to broker, maybe the connection is closed? {:?}",
                        id, e
                    );
                }
            }
        }

        let in_flight = self.message_finished();
        debug!("Messages being consumed: {}", in_flight);

        if let Err(e) = self.check_for_safe_shutdown().await {
            error!("Closing the connector failed {:?}", e);
        }
    }

    fn setup_signal_listener(&self) {
        let mut listener = self.inner.signals.subscribe();
        let connector = self.clone();

        let handle = tokio::spawn(async move {
            while let Some(signal) = listener.recv().await {
                warn!("Received signal {}, closing after child processes end.", signal);

                if let Err(e) = connector.drain().await {
                    error!("Closing after signal failed {:?}", e);
                }
            }
        });

        if let Some(previous) = self.state().signal_listener.replace(handle) {
            previous.abort();
        }
    }

    /// Stop receiving messages and close the connection when the messages being processed are
    /// finished.
    pub async fn drain(&self) -> Result<()> {
        // a channel closed by the broker cannot cancel, the connection is still closed
        if let Err(e) = self.abort_consumers().await {
            error!("Cannot cancel consumers {:?}", e);
        }

        self.check_for_safe_shutdown().await
    }

    /// Forward a termination signal to the running child processes and wait at most
    /// `grace_period` until they end and the connector is closed.
    pub async fn terminate(&self, grace_period: Duration) {
        let listeners = self.inner.signals.dispatch(InterceptedSignal::Terminate);

        if listeners == 0 {
            return;
        }

        if tokio::time::timeout(grace_period, self.closed()).await.is_err() {
            warn!("Child processes are still running after {:?}", grace_period);
        }
    }

    async fn check_for_safe_shutdown(&self) -> Result<()> {
        let ready = {
            let state = self.state();

            state.phase == Phase::Draining && state.in_flight == 0
        };

        if ready {
            warn!("All consumers finished, closing connection");

            self.close().await?;
        }

        Ok(())
    }

    /// Cancel the consumers, so no more messages are delivered. The cancelling runs only once,
    /// the later calls get the result of the first one.
    pub async fn abort_consumers(&self) -> Result<()> {
        let abort = {
            let mut state = self.state();

            match &state.abort {
                Some(abort) => abort.clone(),
                None => {
                    if state.phase != Phase::Closed {
                        state.phase = Phase::Draining;
                    }

                    let mut consumer_tags: Vec<String> = state.consumer_tag.take().into_iter().collect();
                    consumer_tags.extend(self.inner.replies.take_consumer_tag());

                    let broker = self.inner.broker.clone();
                    let abort = memoize(async move {
                        futures::future::try_join_all(consumer_tags.iter().map(|consumer_tag| {
                            debug!("Canceling the consumer {}", consumer_tag);

                            broker.cancel(consumer_tag)
                        }))
                        .await?;

                        Ok(())
                    });

                    state.abort = Some(abort.clone());
                    abort
                }
            }
        };

        outcome(abort.await)
    }

    /// Cancel the consumers and close the connection. Closing happens only once, every call gets
    /// the result of the first close.
    pub async fn close(&self) -> Result<()> {
        let close = {
            let mut state = self.state();

            match &state.close {
                Some(close) => close.clone(),
                None => {
                    let connector = self.clone();
                    let close = memoize(async move { connector.close_connection().await });

                    state.close = Some(close.clone());
                    close
                }
            }
        };

        outcome(close.await)
    }

    async fn close_connection(&self) -> Result<()> {
        let (watchdog, signal_listener) = {
            let mut state = self.state();

            (state.watchdog.take(), state.signal_listener.take())
        };

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        if let Some(signal_listener) = signal_listener {
            signal_listener.abort();
        }

        let aborted = self.abort_consumers().await;

        if let Err(e) = &aborted {
            error!("Cannot cancel consumers {:?}", e);
        }

        info!("Closing amqp connection");

        if let Err(e) = self.inner.broker.close().await {
            warn!(
                "Failed to close connection to amqp, it probably has been closed before {:?}",
                e
            );
        }

        self.state().phase = Phase::Closed;
        self.inner.closed.send_replace(true);

        aborted
    }

    /// Publish a message with a generated message id. With request-reply the call finishes when
    /// the consumer of the message replied or the reply timeout elapsed.
    pub async fn publish_message(&self, config: &PublishConfig, content: Bytes) -> Result<()> {
        let message_id = rand::random::<u64>().to_string();
        let id = format!("[message {}]", message_id);

        debug!("{} Publishing message", id);

        let mut properties = PublishProperties {
            message_id: Some(message_id.clone()),
            content_type: config.content_type.clone(),
            ..Default::default()
        };

        let pending_reply = if config.request_reply {
            debug!("{} Setting up reply request", id);

            properties.reply_to = Some(self.inner.replies.reply_queue().await?);
            properties.correlation_id = Some(message_id);

            Some(self.inner.replies.await_reply(&properties).await?)
        } else {
            None
        };

        self.inner
            .broker
            .publish(&config.exchange, &config.routing_key, content, properties.clone())
            .await?;

        info!(
            "{} Published message exchange={} routing_key={} properties={:?}",
            id, config.exchange, config.routing_key, properties
        );

        let reply = async {
            match pending_reply {
                Some(pending_reply) => pending_reply.wait(config.reply_timeout).await,
                None => Ok(()),
            }
        };

        // the reply can time out while we are waiting for the confirm
        let (confirmed, replied) = tokio::join!(self.inner.broker.wait_for_confirms(), reply);

        confirmed?;
        replied
    }
}

/// Run the operation in its own task and make its result shareable.
fn memoize<F>(operation: F) -> SharedOutcome
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let handle = tokio::spawn(operation);

    async move {
        match handle.await {
            Ok(result) => result.map_err(Arc::new),
            Err(e) => Err(Arc::new(anyhow::Error::new(e))),
        }
    }
    .boxed()
    .shared()
}

fn outcome(result: std::result::Result<(), Arc<anyhow::Error>>) -> Result<()> {
    result.map_err(|e| anyhow!("{:#}", e))
}
