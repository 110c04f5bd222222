//! Per-connection liveness probe state machine.
//!
//! ```text
//! Idle --tick--> ProbeSent --pong--> Idle
//!                    |
//!                    +--grace expired / next tick--> Dead
//! ```
//!
//! The machine is pure; the connection loop owns the probe interval and the
//! grace deadline and feeds events in. One unanswered probe is fatal: the
//! grace deadline normally fires first, and a tick that finds the previous
//! probe still outstanding (grace not shorter than the period) terminates too.

use std::time::Duration;

use tokio::time::Instant;

/// Default time between probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);
/// Default time a probe may stay unanswered.
pub const DEFAULT_PROBE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    ProbeSent { sent_at: Instant },
    Dead,
}

/// What the connection loop must do after a probe tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Send a ping and arm the grace deadline.
    SendProbe,
    /// The previous probe was never answered.
    Terminate,
}

#[derive(Debug)]
pub struct Liveness {
    state: ProbeState,
    last_pong: Instant,
    missed: u32,
}

impl Liveness {
    pub fn new(now: Instant) -> Self {
        Self {
            state: ProbeState::Idle,
            last_pong: now,
            missed: 0,
        }
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    pub fn last_pong(&self) -> Instant {
        self.last_pong
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn on_tick(&mut self, now: Instant) -> TickAction {
        match self.state {
            ProbeState::Idle => {
                self.state = ProbeState::ProbeSent { sent_at: now };
                TickAction::SendProbe
            }
            ProbeState::ProbeSent { .. } => {
                self.missed += 1;
                self.state = ProbeState::Dead;
                TickAction::Terminate
            }
            ProbeState::Dead => TickAction::Terminate,
        }
    }

    /// A pong arrived. Returns the round-trip time when it answers a probe.
    pub fn on_pong(&mut self, now: Instant) -> Option<Duration> {
        let rtt = match self.state {
            ProbeState::ProbeSent { sent_at } => Some(now.saturating_duration_since(sent_at)),
            ProbeState::Idle => None,
            ProbeState::Dead => return None,
        };
        self.state = ProbeState::Idle;
        self.last_pong = now;
        self.missed = 0;
        rtt
    }

    /// The grace deadline armed by the last probe fired. Returns `true` when
    /// the connection must be terminated.
    pub fn on_grace_expired(&mut self) -> bool {
        match self.state {
            ProbeState::ProbeSent { .. } => {
                self.missed += 1;
                self.state = ProbeState::Dead;
                true
            }
            ProbeState::Dead => true,
            ProbeState::Idle => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn answered_probe_returns_to_idle() {
        let t0 = Instant::now();
        let mut l = Liveness::new(t0);
        assert_eq!(l.on_tick(t0), TickAction::SendProbe);
        assert!(matches!(l.state(), ProbeState::ProbeSent { .. }));

        let t1 = t0 + Duration::from_millis(40);
        assert_eq!(l.on_pong(t1), Some(Duration::from_millis(40)));
        assert_eq!(l.state(), ProbeState::Idle);
        assert_eq!(l.last_pong(), t1);
        assert!(!l.on_grace_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_while_probe_sent_is_fatal() {
        let t0 = Instant::now();
        let mut l = Liveness::new(t0);
        l.on_tick(t0);
        assert!(l.on_grace_expired());
        assert_eq!(l.state(), ProbeState::Dead);
        assert_eq!(l.missed(), 1);
        // A pong after death does not revive the connection.
        assert_eq!(l.on_pong(t0 + Duration::from_secs(6)), None);
        assert_eq!(l.state(), ProbeState::Dead);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_with_outstanding_probe_terminates() {
        let t0 = Instant::now();
        let mut l = Liveness::new(t0);
        assert_eq!(l.on_tick(t0), TickAction::SendProbe);
        assert_eq!(l.on_tick(t0 + DEFAULT_PROBE_INTERVAL), TickAction::Terminate);
        assert_eq!(l.on_tick(t0 + DEFAULT_PROBE_INTERVAL * 2), TickAction::Terminate);
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_pong_resets_missed_count() {
        let t0 = Instant::now();
        let mut l = Liveness::new(t0);
        assert_eq!(l.on_pong(t0 + Duration::from_secs(1)), None);
        assert_eq!(l.state(), ProbeState::Idle);
        assert_eq!(l.missed(), 0);
        assert_eq!(l.on_tick(t0 + DEFAULT_PROBE_INTERVAL), TickAction::SendProbe);
    }
}
