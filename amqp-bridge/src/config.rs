//! Command line and configuration file handling.
//!
//! The parsed arguments are turned into typed configuration structs once, the connector and the
//! commands only see those structs.

use crate::error::BridgeError;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_derive::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection parameters of the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub vhost: String,
    /// Heartbeat in seconds.
    pub heartbeat: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: "localhost".to_owned(),
            port: 5672,
            username: None,
            password: None,
            vhost: "/".to_owned(),
            heartbeat: 60,
        }
    }
}

/// Settings common for consuming from a queue or from an exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumeConfig {
    /// Number of messages processed in parallel (unacked messages).
    pub prefetch: u16,
    /// Stop consuming and close the connection if a message cannot be processed.
    pub close_on_consumer_error: bool,
    /// Command executed for every message.
    pub command: String,
    pub args: Vec<String>,
    /// How often the consumed queue is checked for existence.
    pub watchdog_period: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueConsumeConfig {
    pub consume: ConsumeConfig,
    pub queue: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeConsumeConfig {
    pub consume: ConsumeConfig,
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishConfig {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: Option<String>,
    /// Wait for the consumer to send back an empty reply.
    pub request_reply: bool,
    /// `None` waits for the reply forever.
    pub reply_timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultiplePublishConfig {
    pub publish: PublishConfig,
    pub separator: Vec<u8>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error | LogLevel::Fatal => log::LevelFilter::Error,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "amqp-bridge", version, about = "Bridge between AMQP messages and commands")]
pub struct Cli {
    /// Path to a TOML config file with a [broker] section
    #[arg(short = 'c', long = "config", value_name = "FILE", env = "AMQP_CONFIG", global = true)]
    pub config_file: Option<PathBuf>,

    #[arg(long, env = "AMQP_HOSTNAME", global = true)]
    pub hostname: Option<String>,

    #[arg(long, env = "AMQP_PORT", global = true)]
    pub port: Option<u16>,

    #[arg(long, env = "AMQP_USER", global = true)]
    pub user: Option<String>,

    #[arg(long, env = "AMQP_PASSWORD", hide_env_values = true, global = true)]
    pub password: Option<String>,

    #[arg(long, env = "AMQP_VHOST", global = true)]
    pub vhost: Option<String>,

    /// Heartbeat in seconds
    #[arg(long, env = "AMQP_HEARTBEAT", global = true)]
    pub heartbeat: Option<u16>,

    #[arg(long, value_enum, default_value = "warn", env = "AMQP_LOG_LEVEL", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Consumes messages from existing queue.
    ConsumeQueue(ConsumeQueueArgs),
    /// Creates an exclusive queue, that will be bound to named exchange with given routing key, and
    /// starts consuming messages.
    ConsumeExchange(ConsumeExchangeArgs),
    /// Publishes message from arguments or stdin to named exchange with given routing key.
    PublishMessage(PublishArgs),
    /// Publishes multiple messages from arguments or stdin to named exchange with given routing
    /// key.
    PublishMultipleMessages(PublishMultipleArgs),
}

#[derive(Debug, Args)]
pub struct ConsumeArgs {
    /// Number of messages processed in parallel
    #[arg(short = 'n', long = "prefetch", visible_alias = "parallel", default_value_t = 5)]
    pub prefetch: u16,

    /// Keep consuming when the command fails for a message
    #[arg(long)]
    pub ignore_consumer_errors: bool,

    /// Seconds between checks whether the consumed queue still exists
    #[arg(long, default_value_t = 60)]
    pub watchdog_period: u64,

    /// Command executed for each message, followed by its arguments
    #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ConsumeQueueArgs {
    #[arg(long)]
    pub queue: String,

    #[command(flatten)]
    pub consume: ConsumeArgs,
}

#[derive(Debug, Args)]
pub struct ConsumeExchangeArgs {
    #[arg(long)]
    pub exchange: String,

    #[arg(long)]
    pub routing_key: String,

    #[command(flatten)]
    pub consume: ConsumeArgs,
}

#[derive(Debug, Args)]
pub struct PublishArgs {
    #[arg(long)]
    pub exchange: String,

    #[arg(long)]
    pub routing_key: String,

    #[arg(long)]
    pub content_type: Option<String>,

    /// Wait for the consumer to acknowledge the message
    #[arg(long)]
    pub request_reply: bool,

    /// Seconds to wait for the reply, negative value waits forever
    #[arg(long, default_value_t = 3600, allow_negative_numbers = true)]
    pub reply_timeout: i64,

    /// Message content, stdin is read if it is missing
    pub content: Option<String>,
}

#[derive(Debug, Args)]
pub struct PublishMultipleArgs {
    #[command(flatten)]
    pub publish: PublishArgs,

    /// Byte sequence separating the messages
    #[arg(long, default_value = "\n")]
    pub separator: String,
}

/// Content of the optional config file.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub broker: BrokerSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct BrokerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub vhost: Option<String>,
    pub heartbeat: Option<u16>,
}

pub fn parse_config_file(path: &Path) -> Result<FileConfig> {
    let cfg = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config file {}", path.display()))?;

    Ok(toml::from_str(&cfg)?)
}

impl Cli {
    /// Broker parameters, command line values override the config file values.
    pub fn broker_config(&self) -> Result<BrokerConfig> {
        let file = match &self.config_file {
            Some(path) => parse_config_file(path)?,
            None => FileConfig::default(),
        };

        Ok(self.merge_broker_config(file.broker))
    }

    fn merge_broker_config(&self, file: BrokerSection) -> BrokerConfig {
        let default = BrokerConfig::default();

        BrokerConfig {
            host: self.hostname.clone().or(file.host).unwrap_or(default.host),
            port: self.port.or(file.port).unwrap_or(default.port),
            username: self.user.clone().or(file.user),
            password: self.password.clone().or(file.password),
            vhost: self.vhost.clone().or(file.vhost).unwrap_or(default.vhost),
            heartbeat: self.heartbeat.or(file.heartbeat).unwrap_or(default.heartbeat),
        }
    }
}

fn not_empty(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(BridgeError::InvalidConfig(format!("{} cannot be empty", what)).into());
    }

    Ok(())
}

impl TryFrom<&ConsumeArgs> for ConsumeConfig {
    type Error = anyhow::Error;

    fn try_from(args: &ConsumeArgs) -> Result<Self> {
        let (command, rest) = args
            .command
            .split_first()
            .ok_or_else(|| BridgeError::InvalidConfig("command is missing".to_owned()))?;

        not_empty(command, "command")?;

        if args.watchdog_period == 0 {
            return Err(BridgeError::InvalidConfig("watchdog period must be positive".to_owned()).into());
        }

        Ok(ConsumeConfig {
            prefetch: args.prefetch,
            close_on_consumer_error: !args.ignore_consumer_errors,
            command: command.clone(),
            args: rest.to_vec(),
            watchdog_period: Duration::from_secs(args.watchdog_period),
        })
    }
}

impl TryFrom<&ConsumeQueueArgs> for QueueConsumeConfig {
    type Error = anyhow::Error;

    fn try_from(args: &ConsumeQueueArgs) -> Result<Self> {
        not_empty(&args.queue, "queue")?;

        Ok(QueueConsumeConfig {
            consume: ConsumeConfig::try_from(&args.consume)?,
            queue: args.queue.clone(),
        })
    }
}

impl TryFrom<&ConsumeExchangeArgs> for ExchangeConsumeConfig {
    type Error = anyhow::Error;

    fn try_from(args: &ConsumeExchangeArgs) -> Result<Self> {
        not_empty(&args.exchange, "exchange")?;

        Ok(ExchangeConsumeConfig {
            consume: ConsumeConfig::try_from(&args.consume)?,
            exchange: args.exchange.clone(),
            routing_key: args.routing_key.clone(),
        })
    }
}

impl From<&PublishArgs> for PublishConfig {
    fn from(args: &PublishArgs) -> Self {
        PublishConfig {
            exchange: args.exchange.clone(),
            routing_key: args.routing_key.clone(),
            content_type: args.content_type.clone(),
            request_reply: args.request_reply,
            reply_timeout: u64::try_from(args.reply_timeout).ok().map(Duration::from_secs),
        }
    }
}

impl TryFrom<&PublishMultipleArgs> for MultiplePublishConfig {
    type Error = anyhow::Error;

    fn try_from(args: &PublishMultipleArgs) -> Result<Self> {
        not_empty(&args.separator, "separator")?;

        Ok(MultiplePublishConfig {
            publish: PublishConfig::from(&args.publish),
            separator: args.separator.as_bytes().to_vec(),
        })
    }
}
