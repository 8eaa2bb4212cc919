//! Bridge between an AMQP broker and command line programs.
//!
//! Messages consumed from a queue (or from a queue bound to an exchange) are passed to a new
//! child process one by one on its standard input. If the process exits successfully the message
//! is acked, otherwise it is nacked. Messages can also be published, optionally waiting for the
//! consumer to process them.
//!
//! ```no_run
//! use amqp_bridge::config::{BrokerConfig, PublishConfig};
//! use amqp_bridge::connector::Connector;
//! use amqp_bridge::signal::SignalRegistry;
//! use std::sync::Arc;
//!
//! # async fn publish() -> anyhow::Result<()> {
//! let on_error = Arc::new(|e: anyhow::Error| log::error!("{:?}", e));
//! let connector = Connector::connect(&BrokerConfig::default(), SignalRegistry::new(), on_error).await?;
//!
//! let config = PublishConfig {
//!     exchange: "x-jobs".to_owned(),
//!     routing_key: "resize".to_owned(),
//!     content_type: None,
//!     request_reply: false,
//!     reply_timeout: None,
//! };
//!
//! connector.publish_message(&config, "image-42".into()).await?;
//! connector.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod connector;
pub mod consumer;
pub mod error;
pub mod process;
pub mod signal;

#[cfg(test)]
mod tests;
