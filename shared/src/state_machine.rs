//! Link and Channel State Machines
//!
//! Defines valid transitions for the device link session and the relay channel.

/// Lifecycle of the wireless link to the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Bound,
    Monitoring,
    Reconnecting,
    Disconnected,
}

/// Events that can trigger link state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connection attempt started
    ConnectRequested,
    /// Link bound, sensors activated, notifications flowing
    Bound,
    /// Liveness monitor started
    MonitorStarted,
    /// Liveness probe failed
    ProbeFailed,
    /// Silent reconnect restored the link
    ReconnectSucceeded,
    /// Connection attempts exhausted or silent reconnect failed
    Failed,
    /// Device dropped the link on its own
    LinkLost,
    /// Teardown completed
    TornDown,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult<S, E> {
    /// Transition was valid and state changed
    Success(S),
    /// Transition was invalid from current state
    Invalid { from: S, event: E },
}

/// State machine for one device link session
#[derive(Debug)]
pub struct LinkStateMachine {
    current_state: LinkState,
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStateMachine {
    pub fn new() -> Self {
        Self {
            current_state: LinkState::Idle,
        }
    }

    pub fn state(&self) -> LinkState {
        self.current_state
    }

    /// Whether the link is believed connected (probes should run)
    pub fn is_live(&self) -> bool {
        matches!(self.current_state, LinkState::Bound | LinkState::Monitoring)
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult<LinkState, LinkEvent> {
        // Teardown always lands back in Idle
        if event == LinkEvent::TornDown {
            self.current_state = LinkState::Idle;
            return TransitionResult::Success(LinkState::Idle);
        }

        match self.get_next_state(event) {
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    fn get_next_state(&self, event: LinkEvent) -> Option<LinkState> {
        use LinkEvent::*;
        use LinkState::*;

        match (self.current_state, event) {
            // A new connect may replace any existing link
            (Idle | LinkState::Bound | Monitoring | Reconnecting | Disconnected, ConnectRequested) => {
                Some(Connecting)
            }

            (Connecting, LinkEvent::Bound) => Some(LinkState::Bound),
            (Connecting, Failed) => Some(Disconnected),

            (LinkState::Bound, MonitorStarted) => Some(Monitoring),

            (Monitoring, ProbeFailed) => Some(Reconnecting),
            (Reconnecting, ReconnectSucceeded) => Some(Monitoring),
            (Reconnecting, Failed) => Some(Disconnected),

            (LinkState::Bound | Monitoring | Reconnecting, LinkLost) => Some(Disconnected),

            _ => None,
        }
    }
}

/// Lifecycle of the relay channel socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
    GivenUp,
}

/// Events that can trigger channel state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    OpenRequested,
    Opened,
    OpenFailed,
    ClosedNormally,
    ClosedAbnormally,
    ReconnectScheduled,
    RetriesExhausted,
}

/// State machine for the relay channel
#[derive(Debug)]
pub struct ChannelStateMachine {
    current_state: ChannelState,
}

impl Default for ChannelStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelStateMachine {
    pub fn new() -> Self {
        Self {
            current_state: ChannelState::Closed,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.current_state
    }

    pub fn process_event(
        &mut self,
        event: ChannelEvent,
    ) -> TransitionResult<ChannelState, ChannelEvent> {
        use ChannelEvent::*;
        use ChannelState::*;

        let next = match (self.current_state, event) {
            // Caller-driven connect is accepted from any state
            (_, OpenRequested) => Some(Connecting),

            (Connecting, Opened) => Some(Open),
            (Connecting, OpenFailed) => Some(Closed),

            (_, ClosedNormally) => Some(Closed),
            (Open, ClosedAbnormally) => Some(Closed),

            (Closed, ReconnectScheduled) => Some(Reconnecting),
            (Reconnecting, ReconnectScheduled) => Some(Reconnecting),
            (Closed | Reconnecting, RetriesExhausted) => Some(GivenUp),

            _ => None,
        };

        match next {
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let fsm = LinkStateMachine::new();
        assert_eq!(fsm.state(), LinkState::Idle);
        assert!(!fsm.is_live());
    }

    #[test]
    fn test_normal_link_flow() {
        let mut fsm = LinkStateMachine::new();

        let result = fsm.process_event(LinkEvent::ConnectRequested);
        assert_eq!(result, TransitionResult::Success(LinkState::Connecting));

        let result = fsm.process_event(LinkEvent::Bound);
        assert_eq!(result, TransitionResult::Success(LinkState::Bound));
        assert!(fsm.is_live());

        let result = fsm.process_event(LinkEvent::MonitorStarted);
        assert_eq!(result, TransitionResult::Success(LinkState::Monitoring));

        let result = fsm.process_event(LinkEvent::ProbeFailed);
        assert_eq!(result, TransitionResult::Success(LinkState::Reconnecting));
        assert!(!fsm.is_live());

        let result = fsm.process_event(LinkEvent::ReconnectSucceeded);
        assert_eq!(result, TransitionResult::Success(LinkState::Monitoring));

        let result = fsm.process_event(LinkEvent::TornDown);
        assert_eq!(result, TransitionResult::Success(LinkState::Idle));
    }

    #[test]
    fn test_failed_silent_reconnect() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);
        fsm.process_event(LinkEvent::Bound);
        fsm.process_event(LinkEvent::MonitorStarted);
        fsm.process_event(LinkEvent::ProbeFailed);

        let result = fsm.process_event(LinkEvent::Failed);
        assert_eq!(result, TransitionResult::Success(LinkState::Disconnected));
    }

    #[test]
    fn test_invalid_link_transition() {
        let mut fsm = LinkStateMachine::new();

        // Can't start monitoring without a bound link
        let result = fsm.process_event(LinkEvent::MonitorStarted);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), LinkState::Idle);

        // A second connect while connecting is rejected
        fsm.process_event(LinkEvent::ConnectRequested);
        let result = fsm.process_event(LinkEvent::ConnectRequested);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
    }

    #[test]
    fn test_link_lost() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);
        fsm.process_event(LinkEvent::Bound);
        fsm.process_event(LinkEvent::MonitorStarted);

        let result = fsm.process_event(LinkEvent::LinkLost);
        assert_eq!(result, TransitionResult::Success(LinkState::Disconnected));
        assert!(!fsm.is_live());
    }

    #[test]
    fn test_channel_reconnect_flow() {
        let mut fsm = ChannelStateMachine::new();
        assert_eq!(fsm.state(), ChannelState::Closed);

        fsm.process_event(ChannelEvent::OpenRequested);
        fsm.process_event(ChannelEvent::Opened);
        assert_eq!(fsm.state(), ChannelState::Open);

        fsm.process_event(ChannelEvent::ClosedAbnormally);
        let result = fsm.process_event(ChannelEvent::ReconnectScheduled);
        assert_eq!(result, TransitionResult::Success(ChannelState::Reconnecting));

        let result = fsm.process_event(ChannelEvent::OpenRequested);
        assert_eq!(result, TransitionResult::Success(ChannelState::Connecting));
        fsm.process_event(ChannelEvent::OpenFailed);
        let result = fsm.process_event(ChannelEvent::RetriesExhausted);
        assert_eq!(result, TransitionResult::Success(ChannelState::GivenUp));

        // Caller can always start over
        let result = fsm.process_event(ChannelEvent::OpenRequested);
        assert_eq!(result, TransitionResult::Success(ChannelState::Connecting));
    }

    #[test]
    fn test_channel_invalid_transition() {
        let mut fsm = ChannelStateMachine::new();
        let result = fsm.process_event(ChannelEvent::Opened);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
    }
}
