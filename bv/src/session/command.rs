//! Lifecycle commands and the FIFO queue that carries them to the worker

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

/// A connect or disconnect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect {
        address: String,
        connection_options: String,
        session_options: String,
    },
    Disconnect,
}

impl Command {
    pub fn connect(
        address: impl Into<String>,
        connection_options: impl Into<String>,
        session_options: impl Into<String>,
    ) -> Self {
        Command::Connect {
            address: address.into(),
            connection_options: connection_options.into(),
            session_options: session_options.into(),
        }
    }

    pub fn wants_connect(&self) -> bool {
        matches!(self, Command::Connect { .. })
    }
}

/// Thread-safe FIFO of pending lifecycle commands
///
/// Every enqueue wakes the worker through the shared [`Notify`].
pub struct CommandQueue {
    commands: Mutex<VecDeque<Command>>,
    wake: Arc<Notify>,
}

impl CommandQueue {
    pub fn new(wake: Arc<Notify>) -> Self {
        Self {
            commands: Mutex::new(VecDeque::new()),
            wake,
        }
    }

    /// Append a command and wake the worker
    pub fn enqueue(&self, command: Command) {
        debug!(?command, "CommandQueue::enqueue: called");
        self.commands.lock().push_back(command);
        self.wake.notify_one();
    }

    /// Remove and return the oldest command, if any
    pub fn try_dequeue_front(&self) -> Option<Command> {
        self.commands.lock().pop_front()
    }

    /// Look at the oldest command without removing it
    pub fn peek_front(&self) -> Option<Command> {
        self.commands.lock().front().cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }
}
