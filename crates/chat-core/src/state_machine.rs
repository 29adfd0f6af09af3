use crate::{
    error::ChatError,
    types::{ConversationCommand, ConversationEvent, ConversationLifecycleState},
};

/// Lifecycle gate for a conversation runtime.
///
/// `apply` validates a command against the current state and returns the
/// transition events it produces; the open flow is completed through
/// `on_open_result`.
#[derive(Debug, Clone)]
pub struct ConversationStateMachine {
    state: ConversationLifecycleState,
}

impl Default for ConversationStateMachine {
    fn default() -> Self {
        Self {
            state: ConversationLifecycleState::Cold,
        }
    }
}

impl ConversationStateMachine {
    pub fn state(&self) -> ConversationLifecycleState {
        self.state
    }

    pub fn apply(
        &mut self,
        command: &ConversationCommand,
    ) -> Result<Vec<ConversationEvent>, ChatError> {
        use ConversationCommand::*;

        match command {
            Open => self.transition_from_state(
                ConversationLifecycleState::Cold,
                ConversationLifecycleState::Opening,
                "open",
            ),
            Close => self.transition_from_any_of(
                &[
                    ConversationLifecycleState::Cold,
                    ConversationLifecycleState::Opening,
                    ConversationLifecycleState::Live,
                ],
                ConversationLifecycleState::Disposed,
                "close",
            ),
            LoadOlder
            | UpdateViewport { .. }
            | Send { .. }
            | Edit { .. }
            | Delete { .. } => {
                if self.state == ConversationLifecycleState::Live {
                    Ok(Vec::new())
                } else {
                    Err(ChatError::invalid_state(self.state, command.kind()))
                }
            }
        }
    }

    /// Finish the open flow: `Live` on success, back to `Cold` on failure.
    pub fn on_open_result(&mut self, success: bool) -> Result<ConversationEvent, ChatError> {
        if self.state != ConversationLifecycleState::Opening {
            return Err(ChatError::invalid_state(self.state, "on_open_result"));
        }

        let next = if success {
            ConversationLifecycleState::Live
        } else {
            ConversationLifecycleState::Cold
        };

        self.state = next;
        Ok(ConversationEvent::StateChanged { state: next })
    }

    fn transition_from_state(
        &mut self,
        expected: ConversationLifecycleState,
        next: ConversationLifecycleState,
        action: &str,
    ) -> Result<Vec<ConversationEvent>, ChatError> {
        self.transition_from_any_of(&[expected], next, action)
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[ConversationLifecycleState],
        next: ConversationLifecycleState,
        action: &str,
    ) -> Result<Vec<ConversationEvent>, ChatError> {
        if !expected.contains(&self.state) {
            return Err(ChatError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![ConversationEvent::StateChanged { state: next }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_command() -> ConversationCommand {
        ConversationCommand::Send {
            client_txn_id: "tx-1".into(),
            content: "hello".into(),
        }
    }

    #[test]
    fn runs_happy_path_state_transitions() {
        let mut sm = ConversationStateMachine::default();

        sm.apply(&ConversationCommand::Open).expect("open must work");
        assert_eq!(sm.state(), ConversationLifecycleState::Opening);

        sm.on_open_result(true).expect("open should resolve");
        assert_eq!(sm.state(), ConversationLifecycleState::Live);

        sm.apply(&ConversationCommand::LoadOlder)
            .expect("load older allowed while live");
        sm.apply(&send_command()).expect("send allowed while live");

        let events = sm.apply(&ConversationCommand::Close).expect("close must work");
        assert_eq!(
            events,
            vec![ConversationEvent::StateChanged {
                state: ConversationLifecycleState::Disposed
            }]
        );
    }

    #[test]
    fn failed_open_returns_to_cold_and_can_retry() {
        let mut sm = ConversationStateMachine::default();
        sm.apply(&ConversationCommand::Open).expect("open must work");
        sm.on_open_result(false).expect("failure should resolve");
        assert_eq!(sm.state(), ConversationLifecycleState::Cold);

        sm.apply(&ConversationCommand::Open).expect("retry open must work");
        assert_eq!(sm.state(), ConversationLifecycleState::Opening);
    }

    #[test]
    fn rejects_timeline_commands_before_live() {
        let mut sm = ConversationStateMachine::default();
        let err = sm.apply(&send_command()).expect_err("send requires live state");
        assert_eq!(err.code, "invalid_state_transition");
        assert!(err.message.contains("'send'"));
    }

    #[test]
    fn disposed_rejects_everything() {
        let mut sm = ConversationStateMachine::default();
        sm.apply(&ConversationCommand::Close).expect("close from cold");

        for command in [
            ConversationCommand::Open,
            ConversationCommand::Close,
            ConversationCommand::LoadOlder,
        ] {
            let err = sm.apply(&command).expect_err("disposed must reject");
            assert_eq!(err.code, "invalid_state_transition");
        }
        assert!(sm.on_open_result(true).is_err());
    }
}
