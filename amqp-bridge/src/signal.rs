//! Dispatching of the termination signals the bridge intercepts.
//!
//! The binary installs the OS signal handlers and dispatches every signal to the registry. The
//! running child processes and the consuming connector subscribe to it, and they stop receiving
//! signals by dropping their listener.

use tokio::sync::broadcast;

/// Signals which are forwarded to the child processes and start a graceful shutdown.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum InterceptedSignal {
    Interrupt,
    Terminate,
}

pub const INTERCEPTED_SIGNALS: [InterceptedSignal; 2] =
    [InterceptedSignal::Interrupt, InterceptedSignal::Terminate];

impl InterceptedSignal {
    pub fn name(&self) -> &'static str {
        match self {
            InterceptedSignal::Interrupt => "SIGINT",
            InterceptedSignal::Terminate => "SIGTERM",
        }
    }

    pub fn number(&self) -> i32 {
        match self {
            InterceptedSignal::Interrupt => 2,
            InterceptedSignal::Terminate => 15,
        }
    }

    /// Exit status of a process which is terminated by this signal.
    pub fn exit_code(&self) -> i32 {
        128 + self.number()
    }

    #[cfg(unix)]
    pub fn as_nix(&self) -> nix::sys::signal::Signal {
        match self {
            InterceptedSignal::Interrupt => nix::sys::signal::Signal::SIGINT,
            InterceptedSignal::Terminate => nix::sys::signal::Signal::SIGTERM,
        }
    }
}

impl std::fmt::Display for InterceptedSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Registry of the components interested in the intercepted signals. Clones share the same
/// listeners.
#[derive(Clone, Debug)]
pub struct SignalRegistry {
    sender: broadcast::Sender<InterceptedSignal>,
}

impl Default for SignalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalRegistry {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);

        SignalRegistry { sender }
    }

    /// Register a listener. It is deregistered when it is dropped.
    pub fn subscribe(&self) -> SignalListener {
        SignalListener {
            receiver: self.sender.subscribe(),
        }
    }

    /// Send the signal to every registered listener, returns the number of listeners reached.
    pub fn dispatch(&self, signal: InterceptedSignal) -> usize {
        self.sender.send(signal).unwrap_or(0)
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct SignalListener {
    receiver: broadcast::Receiver<InterceptedSignal>,
}

impl SignalListener {
    /// Wait for the next signal. Returns `None` if the registry is gone.
    pub async fn recv(&mut self) -> Option<InterceptedSignal> {
        loop {
            match self.receiver.recv().await {
                Ok(signal) => return Some(signal),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_reaches_every_listener() {
        let registry = SignalRegistry::new();
        let mut first = registry.subscribe();
        let mut second = registry.subscribe();

        assert_eq!(registry.dispatch(InterceptedSignal::Terminate), 2);
        assert_eq!(first.recv().await, Some(InterceptedSignal::Terminate));
        assert_eq!(second.recv().await, Some(InterceptedSignal::Terminate));
    }

    #[test]
    fn dropped_listener_is_deregistered() {
        let registry = SignalRegistry::new();
        let listener = registry.subscribe();

        assert_eq!(registry.listener_count(), 1);

        drop(listener);

        assert_eq!(registry.listener_count(), 0);
        assert_eq!(registry.dispatch(InterceptedSignal::Interrupt), 0);
    }

    #[test]
    fn exit_code_follows_shell_convention() {
        assert_eq!(InterceptedSignal::Interrupt.exit_code(), 130);
        assert_eq!(InterceptedSignal::Terminate.exit_code(), 143);
        assert_eq!(InterceptedSignal::Terminate.to_string(), "SIGTERM");
    }
}
