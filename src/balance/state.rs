use serde::{Deserialize, Serialize};
use std::fmt;

/// Health of a backend target, deciding which kinds of traffic may open new
/// connections to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendState {
    /// Configured but not yet initialized.
    New,
    /// Administratively disabled.
    Standby,
    /// Only sticky-session traffic is accepted.
    SessionOnly,
    /// Enabled, waiting for the first successful connect.
    Starting,
    /// Connected at least once; throttled by the slow-start schedule.
    Warmup,
    /// Backend reported overload.
    Busy,
    /// Connect or request failure; retried after the recovery interval.
    Fail,
    /// Fully live and unthrottled.
    Active,
    /// Terminal.
    Closed,
}

/// Signals that drive [`BackendState::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Init,
    Start,
    Active,
    Fail,
    Busy,
    Standby,
    SessionOnly,
    Wake,
    /// First successful connect since (re)start.
    FirstConnect { warmup: bool },
    Close,
}

impl BackendState {
    /// Pool has been initialized and not closed; connections may be opened.
    pub fn is_init(self) -> bool {
        !matches!(self, BackendState::New | BackendState::Closed)
    }

    pub fn is_closed(self) -> bool {
        self == BackendState::Closed
    }

    /// Still ramping up: throttled by warmup or recovering from failure.
    pub fn is_starting(self) -> bool {
        matches!(
            self,
            BackendState::Starting | BackendState::Warmup | BackendState::Busy | BackendState::Fail
        )
    }

    /// Counts toward availability.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            BackendState::Starting | BackendState::Warmup | BackendState::Active
        )
    }

    pub fn is_session_enabled(self) -> bool {
        !matches!(
            self,
            BackendState::New | BackendState::Standby | BackendState::Closed
        )
    }

    /// Accepts general load-balanced traffic.
    pub fn is_enabled(self) -> bool {
        !matches!(
            self,
            BackendState::New
                | BackendState::Standby
                | BackendState::SessionOnly
                | BackendState::Closed
        )
    }

    /// Next state after `event`. Runtime failure signals cannot pull a backend
    /// out of an administrative state; only `Start` (or `Close`) can.
    pub fn transition(self, event: StateEvent) -> BackendState {
        use BackendState::*;

        if self == Closed {
            return Closed;
        }

        match event {
            StateEvent::Init => match self {
                New => Starting,
                other => other,
            },
            StateEvent::Start => match self {
                Warmup | Active => self,
                _ => Starting,
            },
            StateEvent::Active => Active,
            StateEvent::Fail => match self {
                New | Standby | SessionOnly => self,
                _ => Fail,
            },
            StateEvent::Busy => match self {
                New | Standby | SessionOnly => self,
                _ => Busy,
            },
            StateEvent::Standby => Standby,
            StateEvent::SessionOnly => match self {
                Standby => Standby,
                _ => SessionOnly,
            },
            StateEvent::Wake => match self {
                Fail => Starting,
                other => other,
            },
            StateEvent::FirstConnect { warmup } => {
                if !self.is_starting() {
                    self
                } else if warmup {
                    Warmup
                } else {
                    Active
                }
            }
            StateEvent::Close => Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendState::New => "NEW",
            BackendState::Standby => "STANDBY",
            BackendState::SessionOnly => "SESSION_ONLY",
            BackendState::Starting => "STARTING",
            BackendState::Warmup => "WARMUP",
            BackendState::Busy => "BUSY",
            BackendState::Fail => "FAIL",
            BackendState::Active => "ACTIVE",
            BackendState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BackendState::*;

    const ALL: [BackendState; 9] = [
        New,
        Standby,
        SessionOnly,
        Starting,
        Warmup,
        Busy,
        Fail,
        Active,
        Closed,
    ];

    const EVENTS: [StateEvent; 11] = [
        StateEvent::Init,
        StateEvent::Start,
        StateEvent::Active,
        StateEvent::Fail,
        StateEvent::Busy,
        StateEvent::Standby,
        StateEvent::SessionOnly,
        StateEvent::Wake,
        StateEvent::FirstConnect { warmup: true },
        StateEvent::FirstConnect { warmup: false },
        StateEvent::Close,
    ];

    #[test]
    fn closed_is_terminal() {
        for event in EVENTS {
            assert_eq!(Closed.transition(event), Closed, "{:?}", event);
        }
    }

    #[test]
    fn init_only_leaves_new() {
        assert_eq!(New.transition(StateEvent::Init), Starting);
        assert_eq!(Standby.transition(StateEvent::Init), Standby);
        assert_eq!(Active.transition(StateEvent::Init), Active);
    }

    #[test]
    fn start_is_idempotent_once_connected() {
        assert_eq!(Warmup.transition(StateEvent::Start), Warmup);
        assert_eq!(Active.transition(StateEvent::Start), Active);
        for state in [New, Standby, SessionOnly, Starting, Busy, Fail] {
            assert_eq!(state.transition(StateEvent::Start), Starting);
        }
    }

    #[test]
    fn administrative_states_ignore_runtime_signals() {
        for state in [Standby, SessionOnly] {
            assert_eq!(state.transition(StateEvent::Fail), state);
            assert_eq!(state.transition(StateEvent::Busy), state);
        }
        assert_eq!(Standby.transition(StateEvent::SessionOnly), Standby);
        assert_eq!(Active.transition(StateEvent::SessionOnly), SessionOnly);
    }

    #[test]
    fn wake_only_recovers_fail() {
        assert_eq!(Fail.transition(StateEvent::Wake), Starting);
        for state in ALL.iter().copied().filter(|s| *s != Fail) {
            assert_eq!(state.transition(StateEvent::Wake), state);
        }
    }

    #[test]
    fn first_connect_promotes_starting_states() {
        for state in [Starting, Busy, Fail] {
            assert_eq!(
                state.transition(StateEvent::FirstConnect { warmup: true }),
                Warmup
            );
            assert_eq!(
                state.transition(StateEvent::FirstConnect { warmup: false }),
                Active
            );
        }
        assert_eq!(
            SessionOnly.transition(StateEvent::FirstConnect { warmup: true }),
            SessionOnly
        );
        assert_eq!(
            Active.transition(StateEvent::FirstConnect { warmup: true }),
            Active
        );
    }

    #[test]
    fn predicates_match_table() {
        assert!(!New.is_init() && !New.is_enabled() && !New.is_session_enabled());
        assert!(Standby.is_init() && !Standby.is_enabled() && !Standby.is_session_enabled());
        assert!(SessionOnly.is_session_enabled() && !SessionOnly.is_enabled());
        assert!(Starting.is_live() && Starting.is_starting());
        assert!(Warmup.is_live() && Warmup.is_starting());
        assert!(!Busy.is_live() && Busy.is_starting() && Busy.is_enabled());
        assert!(!Fail.is_live() && Fail.is_starting() && Fail.is_enabled());
        assert!(Active.is_live() && !Active.is_starting());
        assert!(Closed.is_closed() && !Closed.is_init() && !Closed.is_live());
    }

    #[test]
    fn serializes_as_upper_case() {
        let json = serde_json::to_string(&SessionOnly).unwrap();
        assert_eq!(json, "\"SESSION_ONLY\"");
        assert_eq!(SessionOnly.to_string(), "SESSION_ONLY");
        let back: BackendState = serde_json::from_str("\"WARMUP\"").unwrap();
        assert_eq!(back, Warmup);
    }
}
