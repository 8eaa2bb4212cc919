use crate::broker::Delivery;
use crate::config::ConsumeConfig;
use crate::connector::MessageHandler;
use crate::process::ProcessRunner;
use futures::FutureExt;
use std::sync::Arc;

/// Message handler which runs the configured command for every message, the message body is
/// the standard input of the command.
pub struct ChildProcessConsumer {
    runner: ProcessRunner,
    command: String,
    args: Vec<String>,
}

impl ChildProcessConsumer {
    pub fn new(runner: ProcessRunner, config: &ConsumeConfig) -> Self {
        ChildProcessConsumer {
            runner,
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }

    pub fn handler(self) -> MessageHandler {
        let consumer = Arc::new(self);

        Arc::new(move |delivery: Delivery| {
            let consumer = consumer.clone();

            async move {
                consumer
                    .runner
                    .run(&consumer.command, &consumer.args, delivery.body)
                    .await
            }
            .boxed()
        })
    }
}
