//! Plumbing between one conversation runtime and the views attached to it.
//!
//! Views hold [`ConversationChannels`]; the runtime owns the matching
//! [`RuntimeEndpoint`]. The runtime never holds a command sender, so its
//! command stream ends once the last view side is dropped.

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{ConversationCommand, ConversationEvent};

/// Receiver of conversation events for one view.
pub type EventStream = broadcast::Receiver<ConversationEvent>;

#[derive(Debug, Error)]
pub enum ConversationChannelError {
    #[error("conversation runtime has stopped")]
    RuntimeStopped,
}

/// View side: submits commands and opens event streams.
#[derive(Clone, Debug)]
pub struct ConversationChannels {
    command_tx: mpsc::Sender<ConversationCommand>,
    event_tx: broadcast::Sender<ConversationEvent>,
}

/// Runtime side: drains commands in order and publishes events.
#[derive(Debug)]
pub struct RuntimeEndpoint {
    pub commands: mpsc::Receiver<ConversationCommand>,
    pub events: broadcast::Sender<ConversationEvent>,
}

impl RuntimeEndpoint {
    /// Publish to every open stream. Views that are not listening miss it.
    pub fn publish(&self, event: ConversationEvent) {
        let _ = self.events.send(event);
    }
}

impl ConversationChannels {
    /// Create the view side and the runtime side of one conversation.
    pub fn new(command_buffer: usize, event_buffer: usize) -> (Self, RuntimeEndpoint) {
        let (command_tx, commands) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        let endpoint = RuntimeEndpoint {
            commands,
            events: event_tx.clone(),
        };
        (
            Self {
                command_tx,
                event_tx,
            },
            endpoint,
        )
    }

    /// Events emitted after this call.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Queue a command; waits while the runtime's buffer is full.
    pub async fn send_command(
        &self,
        command: ConversationCommand,
    ) -> Result<(), ConversationChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ConversationChannelError::RuntimeStopped)
    }
}
