use std::fmt;
use std::time::Duration;

/// Failure of a child process started for a message.
///
/// These errors are logged by the process runner when they happen, so the code which handles the
/// failed delivery doesn't need to log them once more.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessError {
    /// The process exited with a non-zero exit code.
    ExitCode(i32),
    /// The process was terminated by a signal.
    Signalled(String),
    /// The spawned process has no writable standard input, so the message cannot be passed.
    NoStdin,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::ExitCode(code) => write!(f, "Child process ended with code {}", code),
            ProcessError::Signalled(signal) => write!(f, "Child process ended due to signal {}", signal),
            ProcessError::NoStdin => write!(
                f,
                "Child process does not have an open stdin, cannot redirect the message"
            ),
        }
    }
}

impl std::error::Error for ProcessError {}

/// Errors of the bridge itself: misuse of the connector, reply timeouts and invalid
/// configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeError {
    /// A connector can have only one consumer.
    ConsumerAlreadyStarted,
    /// The connector is closing or closed, it cannot start consuming.
    ConnectorClosed,
    /// Waiting for a reply needs both the reply-to queue and the correlation id.
    MissingReplyRouting,
    /// The reply of a request-reply publish didn't arrive in time.
    ReplyTimeout(Duration),
    /// A message arrived while the consumer was closing, it is not processed.
    Draining,
    /// Configuration value which cannot be used.
    InvalidConfig(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::ConsumerAlreadyStarted => write!(f, "Consumer already started for this connector"),
            BridgeError::ConnectorClosed => write!(f, "Connector is closing or already closed"),
            BridgeError::MissingReplyRouting => {
                write!(f, "Both reply-to and correlation id must be set to await a reply")
            }
            BridgeError::ReplyTimeout(timeout) => {
                write!(f, "Reply timed out after {}ms", timeout.as_millis())
            }
            BridgeError::Draining => write!(f, "Consumer is closing but we got another message, skip it"),
            BridgeError::InvalidConfig(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for BridgeError {}

/// Shorthand for returning a `BridgeError` as an `anyhow` error.
#[macro_export]
macro_rules! bridge_error {
    ($err:expr) => {
        ::std::result::Result::Err(anyhow::Error::new($err))
    };
}

/// Returns the `BridgeError` if the error is one.
pub fn as_bridge_error(err: &anyhow::Error) -> Option<&BridgeError> {
    err.downcast_ref::<BridgeError>()
}

/// Returns the `ProcessError` if the error is one.
pub fn as_process_error(err: &anyhow::Error) -> Option<&ProcessError> {
    err.downcast_ref::<ProcessError>()
}
