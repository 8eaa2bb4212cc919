mod shutdown;

use crate::broker::Delivery;
use crate::config::{ConsumeConfig, ExchangeConsumeConfig, PublishConfig, QueueConsumeConfig};
use crate::connector::{Connector, MessageHandler};
use crate::error::ProcessError;
use crate::signal::SignalRegistry;
use anyhow::Result;
use bytes::Bytes;
use futures::FutureExt;
use mock_broker::MockBroker;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A connector over a mock broker. The errors passed to the error callback are collected.
struct TestCase {
    broker: Arc<MockBroker>,
    signals: SignalRegistry,
    connector: Connector,
    errors: Arc<Mutex<Vec<String>>>,
}

impl TestCase {
    fn new() -> Self {
        let broker = Arc::new(MockBroker::new());
        let signals = SignalRegistry::new();
        let errors = Arc::new(Mutex::new(vec![]));

        let collected = errors.clone();
        let connector = Connector::new(
            broker.clone(),
            signals.clone(),
            Arc::new(move |e: anyhow::Error| collected.lock().unwrap().push(format!("{:#}", e))),
        );

        TestCase {
            broker,
            signals,
            connector,
            errors,
        }
    }

    fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

fn consume_config(prefetch: u16, close_on_consumer_error: bool) -> ConsumeConfig {
    ConsumeConfig {
        prefetch,
        close_on_consumer_error,
        command: "test-handler".to_owned(),
        args: vec![],
        watchdog_period: Duration::from_secs(60),
    }
}

fn queue_config(queue: &str, prefetch: u16, close_on_consumer_error: bool) -> QueueConsumeConfig {
    QueueConsumeConfig {
        consume: consume_config(prefetch, close_on_consumer_error),
        queue: queue.to_owned(),
    }
}

fn exchange_config(exchange: &str, routing_key: &str) -> ExchangeConsumeConfig {
    ExchangeConsumeConfig {
        consume: consume_config(5, true),
        exchange: exchange.to_owned(),
        routing_key: routing_key.to_owned(),
    }
}

fn publish_config(request_reply: bool, reply_timeout: Option<Duration>) -> PublishConfig {
    PublishConfig {
        exchange: "x-jobs".to_owned(),
        routing_key: "resize".to_owned(),
        content_type: Some("text/plain".to_owned()),
        request_reply,
        reply_timeout,
    }
}

/// Message handler driven by the message body:
/// - `exit:N` fails like a process exiting with code N
/// - `sleep:MS` succeeds after MS milliseconds
/// - `fail` fails with a plain error
/// - anything else succeeds immediately
#[derive(Clone, Default)]
struct TestHandler {
    handled: Arc<Mutex<Vec<Bytes>>>,
}

impl TestHandler {
    fn handled(&self) -> Vec<Bytes> {
        self.handled.lock().unwrap().clone()
    }

    fn handled_count(&self) -> usize {
        self.handled.lock().unwrap().len()
    }

    fn handler(&self) -> MessageHandler {
        let handled = self.handled.clone();

        Arc::new(move |delivery: Delivery| {
            let handled = handled.clone();

            async move {
                handled.lock().unwrap().push(delivery.body.clone());
                handle(&delivery.body).await
            }
            .boxed()
        })
    }
}

async fn handle(body: &[u8]) -> Result<()> {
    let body = String::from_utf8_lossy(body);

    if let Some(code) = body.strip_prefix("exit:") {
        return Err(ProcessError::ExitCode(code.parse()?).into());
    }

    if let Some(millis) = body.strip_prefix("sleep:") {
        tokio::time::sleep(Duration::from_millis(millis.parse()?)).await;

        return Ok(());
    }

    if body == "fail" {
        anyhow::bail!("Handler failed");
    }

    Ok(())
}

/// Wait until the condition holds, panics if it doesn't happen in a few seconds.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..5000 {
        if condition() {
            return;
        }

        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    panic!("Condition is not met in time");
}
