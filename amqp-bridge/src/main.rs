use amqp_bridge::broker::ErrorCallback;
use amqp_bridge::codec::SeparatorCodec;
use amqp_bridge::config::{
    BrokerConfig, Cli, Command, ExchangeConsumeConfig, MultiplePublishConfig, PublishArgs, PublishConfig,
    QueueConsumeConfig,
};
use amqp_bridge::connector::Connector;
use amqp_bridge::consumer::ChildProcessConsumer;
use amqp_bridge::process::ProcessRunner;
use amqp_bridge::signal::{InterceptedSignal, SignalRegistry, INTERCEPTED_SIGNALS};
use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use env_logger::Builder;
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

fn setup_logger(level: log::LevelFilter) {
    let mut builder = Builder::new();

    builder
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .format(|buf, record| {
            let lvl = buf.default_level_style(record.level()).bold();

            writeln!(
                buf,
                "{} - [{}{:5}{:#}] {}:{} - {}",
                buf.timestamp_millis(),
                lvl,
                record.level(),
                lvl,
                record.file().unwrap_or_default(),
                record.line().unwrap_or_default(),
                record.args()
            )
        })
        .init();
}

/// Install the OS signal handlers. Signals are dispatched to the registered listeners, without
/// listeners the process exits the way the signal would terminate it.
#[cfg(unix)]
fn intercept_signals(signals: SignalRegistry) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    for intercepted in INTERCEPTED_SIGNALS {
        let kind = match intercepted {
            InterceptedSignal::Interrupt => SignalKind::interrupt(),
            InterceptedSignal::Terminate => SignalKind::terminate(),
        };
        let mut stream = signal(kind)?;
        let signals = signals.clone();

        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                dispatch_signal(&signals, intercepted);
            }
        });
    }

    Ok(())
}

#[cfg(not(unix))]
fn intercept_signals(signals: SignalRegistry) -> Result<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            dispatch_signal(&signals, InterceptedSignal::Interrupt);
        }
    });

    Ok(())
}

fn dispatch_signal(signals: &SignalRegistry, signal: InterceptedSignal) {
    let listeners = signals.dispatch(signal);

    debug!("Signal {} dispatched to {} listeners", signal, listeners);

    if listeners == 0 {
        warn!("Received signal {}, exiting", signal);

        std::process::exit(signal.exit_code());
    }
}

/// Time the child processes get to finish after a fatal error.
const FATAL_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Run the future until it finishes or a fatal error of the connection arrives. After a fatal
/// error the running child processes are terminated before returning.
async fn until_fatal<F>(
    connector: &Connector,
    fatal: &mut mpsc::UnboundedReceiver<anyhow::Error>,
    future: F,
) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let err = tokio::select! {
        result = future => return result,
        Some(err) = fatal.recv() => err,
    };

    warn!("Fatal error, terminating the child processes");

    connector.terminate(FATAL_GRACE_PERIOD).await;

    Err(err)
}

async fn read_stdin() -> Result<Bytes> {
    let mut content = vec![];

    tokio::io::stdin().read_to_end(&mut content).await?;

    Ok(Bytes::from(content))
}

async fn close_after(connector: &Connector, result: Result<()>) -> Result<()> {
    let closed = connector.close().await;

    result?;
    closed
}

async fn consume_queue(connector: &Connector, signals: SignalRegistry, config: QueueConsumeConfig) -> Result<()> {
    let handler = ChildProcessConsumer::new(ProcessRunner::new(signals), &config.consume).handler();

    connector.consume_from_queue(&config, handler).await?;
    connector.closed().await;

    info!("Disconnected from amqp");

    Ok(())
}

async fn consume_exchange(
    connector: &Connector,
    signals: SignalRegistry,
    config: ExchangeConsumeConfig,
) -> Result<()> {
    let handler = ChildProcessConsumer::new(ProcessRunner::new(signals), &config.consume).handler();

    connector.consume_commands_from_exchange(&config, handler).await?;
    connector.closed().await;

    info!("Disconnected from amqp");

    Ok(())
}

async fn publish(connector: &Connector, args: &PublishArgs) -> Result<()> {
    let config = PublishConfig::from(args);

    let result = async {
        let content = match &args.content {
            Some(content) => Bytes::from(content.clone()),
            None => read_stdin().await?,
        };

        debug!("Emitting message: {}", String::from_utf8_lossy(&content));

        connector.publish_message(&config, content).await
    }
    .await;

    close_after(connector, result).await
}

async fn publish_multiple(connector: &Connector, config: MultiplePublishConfig, content: Option<String>) -> Result<()> {
    let input: Box<dyn AsyncRead + Send + Unpin> = match content {
        Some(content) => Box::new(std::io::Cursor::new(content.into_bytes())),
        None => Box::new(tokio::io::stdin()),
    };
    let mut messages = FramedRead::new(input, SeparatorCodec::new(config.separator.clone()));
    let mut publishes = vec![];

    let read = async {
        while let Some(message) = messages.next().await {
            let message = message?;

            debug!("Emitting message: {}", String::from_utf8_lossy(&message));

            let connector = connector.clone();
            let config = config.publish.clone();

            publishes.push(tokio::spawn(async move {
                connector.publish_message(&config, message).await
            }));
        }

        if messages.decoder().ended_with_separator() {
            info!("Not emitting empty last message (the input stream ended with a separator sequence)");
        }

        Ok::<(), anyhow::Error>(())
    }
    .await;

    let published = futures::future::join_all(publishes).await;

    let result = read.and_then(|_| {
        for result in published {
            result??;
        }

        Ok(())
    });

    close_after(connector, result).await
}

async fn run(cli: Cli) -> Result<()> {
    let broker_config: BrokerConfig = cli.broker_config()?;
    let signals = SignalRegistry::new();

    intercept_signals(signals.clone())?;

    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let on_error: ErrorCallback = Arc::new(move |err: anyhow::Error| {
        let _ = fatal_tx.send(err);
    });

    match cli.command {
        Command::ConsumeQueue(args) => {
            let config = QueueConsumeConfig::try_from(&args)?;
            let connector = Connector::connect(&broker_config, signals.clone(), on_error).await?;

            until_fatal(&connector, &mut fatal_rx, consume_queue(&connector, signals, config)).await
        }
        Command::ConsumeExchange(args) => {
            let config = ExchangeConsumeConfig::try_from(&args)?;
            let connector = Connector::connect(&broker_config, signals.clone(), on_error).await?;

            until_fatal(&connector, &mut fatal_rx, consume_exchange(&connector, signals, config)).await
        }
        Command::PublishMessage(args) => {
            let connector = Connector::connect(&broker_config, signals, on_error).await?;

            until_fatal(&connector, &mut fatal_rx, publish(&connector, &args)).await
        }
        Command::PublishMultipleMessages(args) => {
            let config = MultiplePublishConfig::try_from(&args)?;
            let connector = Connector::connect(&broker_config, signals, on_error).await?;

            until_fatal(
                &connector,
                &mut fatal_rx,
                publish_multiple(&connector, config, args.publish.content),
            )
            .await
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    setup_logger(cli.log_level.into());

    if let Err(e) = run(cli).await {
        error!("{:?}", e);

        std::process::exit(1);
    }
}
