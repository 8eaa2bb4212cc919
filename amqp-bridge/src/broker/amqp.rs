use super::{Broker, Consumer, Delivery, ErrorCallback, PublishProperties};
use crate::config::BrokerConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use log::{debug, info};

/// Broker over an AMQP 0.9.1 connection. It opens one channel in confirm mode and every
/// operation goes through that channel.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    /// Connect to the broker and open the channel. Errors of the connection which happen later
    /// are passed to `on_error`.
    pub async fn connect(config: &BrokerConfig, on_error: ErrorCallback) -> Result<AmqpBroker> {
        info!(
            "Connecting to amqp host={} port={} user={} vhost={} heartbeat={} password=<censored>",
            config.host,
            config.port,
            config.username.as_deref().unwrap_or("<default>"),
            config.vhost,
            config.heartbeat
        );

        let connection = Connection::connect_uri(amqp_uri(config), ConnectionProperties::default())
            .await
            .with_context(|| format!("Cannot connect to {}:{}", config.host, config.port))?;

        connection.on_error(move |err| on_error(anyhow::Error::new(err)));

        let channel = connection.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        debug!("Opened amqp channel {} in confirm mode", channel.id());

        Ok(AmqpBroker { connection, channel })
    }
}

fn amqp_uri(config: &BrokerConfig) -> AMQPUri {
    let mut uri = AMQPUri::default();
    let default_user = AMQPUserInfo::default();

    uri.authority = AMQPAuthority {
        userinfo: AMQPUserInfo {
            username: config.username.clone().unwrap_or(default_user.username),
            password: config.password.clone().unwrap_or(default_user.password),
        },
        host: config.host.clone(),
        port: config.port,
    };
    uri.vhost = config.vhost.clone();
    uri.query = AMQPQueryString {
        heartbeat: Some(config.heartbeat),
        ..Default::default()
    };

    uri
}

fn to_string(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_owned())
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            message_id: to_string(delivery.properties.message_id()),
            reply_to: to_string(delivery.properties.reply_to()),
            correlation_id: to_string(delivery.properties.correlation_id()),
            body: Bytes::from(delivery.data),
        }
    }
}

impl From<PublishProperties> for BasicProperties {
    fn from(props: PublishProperties) -> Self {
        let mut properties = BasicProperties::default();

        if let Some(message_id) = props.message_id {
            properties = properties.with_message_id(message_id.into());
        }
        if let Some(content_type) = props.content_type {
            properties = properties.with_content_type(content_type.into());
        }
        if let Some(reply_to) = props.reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }
        if let Some(correlation_id) = props.correlation_id {
            properties = properties.with_correlation_id(correlation_id.into());
        }

        properties
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn prefetch(&self, count: u16) -> Result<()> {
        self.channel.basic_qos(count, BasicQosOptions::default()).await?;

        Ok(())
    }

    async fn assert_exclusive_queue(&self) -> Result<String> {
        let options = QueueDeclareOptions {
            exclusive: true,
            ..Default::default()
        };
        let queue = self.channel.queue_declare("", options, FieldTable::default()).await?;

        Ok(queue.name().as_str().to_owned())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<Consumer> {
        let options = BasicConsumeOptions {
            no_ack,
            ..Default::default()
        };
        // empty consumer tag lets the server generate one
        let consumer = self
            .channel
            .basic_consume(queue, "", options, FieldTable::default())
            .await?;

        let consumer_tag = consumer.tag().as_str().to_owned();
        let deliveries = consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(anyhow::Error::new))
            .boxed();

        Ok(Consumer {
            consumer_tag,
            deliveries,
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Bytes,
        properties: PublishProperties,
    ) -> Result<()> {
        // The returned confirm is dropped, `wait_for_confirms` waits for all of them.
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &content,
                properties.into(),
            )
            .await?;

        Ok(())
    }

    async fn wait_for_confirms(&self) -> Result<()> {
        let returned = self.channel.wait_for_confirms().await?;

        if !returned.is_empty() {
            return Err(anyhow!("{} message(s) returned by the broker", returned.len()));
        }

        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;

        Ok(())
    }

    async fn nack(&self, delivery_tag: u64) -> Result<()> {
        let options = BasicNackOptions {
            multiple: false,
            requeue: true,
        };
        self.channel.basic_nack(delivery_tag, options).await?;

        Ok(())
    }

    async fn check_queue(&self, queue: &str) -> Result<()> {
        let options = QueueDeclareOptions {
            passive: true,
            ..Default::default()
        };
        self.channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .with_context(|| format!("Queue {} is gone", queue))?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connection.close(200, "Normal close").await?;

        Ok(())
    }
}
