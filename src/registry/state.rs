use thiserror::Error;

/// Registration status of one `setup` announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    /// Setup received, debugger attach in flight
    PendingAttach,
    Registered,
    /// Attach failed; never registered
    Rejected,
    /// Killed, or superseded by a later setup with the same identifier
    Removed,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(RegistrationState, RegistrationState),
}

/// Registration record of one session identifier.
///
/// Concurrent setups for the same identifier share the record; it stays in
/// `PendingAttach` until the last of their attaches has resolved.
#[derive(Debug)]
pub struct Registration {
    pub session_id: String,
    pub state: RegistrationState,
    /// Setups whose debugger attach has not resolved yet
    pub in_flight: usize,
}

impl Registration {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            state: RegistrationState::Unregistered,
            in_flight: 0,
        }
    }

    pub fn can_transition(&self, to: RegistrationState) -> bool {
        use RegistrationState::*;
        matches!(
            (self.state, to),
            (Unregistered, PendingAttach)
                | (PendingAttach, Registered)
                | (PendingAttach, Rejected)
                | (Registered, Removed)
                | (Removed, PendingAttach)
        )
    }

    pub fn transition(&mut self, to: RegistrationState) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::debug!("Session {}: {:?} -> {:?}", self.session_id, self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RegistrationState::*;

    #[test]
    fn valid_transitions() {
        let mut reg = Registration::new("a");
        assert_eq!(reg.state, Unregistered);
        assert!(reg.transition(PendingAttach).is_ok());
        assert!(reg.transition(Registered).is_ok());
        assert!(reg.transition(Removed).is_ok());
        // superseded by a new setup
        assert!(reg.transition(PendingAttach).is_ok());
        assert!(reg.transition(Rejected).is_ok());
    }

    #[test]
    fn invalid_transition() {
        let mut reg = Registration::new("a");
        assert_eq!(
            reg.transition(Registered),
            Err(TransitionError::InvalidTransition(Unregistered, Registered))
        );
        reg.transition(PendingAttach).unwrap();
        reg.transition(Rejected).unwrap();
        // rejected is terminal
        assert!(reg.transition(Registered).is_err());
        assert!(reg.transition(Removed).is_err());
    }
}
