//! Sensor-stream watchdog state machine (§4.2, supplemented by
//! `original_source/roomba.py::ensure_sensor_stream`).
//!
//! Distinguishes "no frame has ever arrived since the last subscribe" from
//! "frames arrived, then went stale", and applies a restart cooldown so a
//! slow-to-sync link doesn't get re-subscribed every watchdog tick.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// `subscribe` has never been called.
    NeverSubscribed,
    /// Subscribed, but no valid frame has arrived yet.
    AwaitingFirstFrame,
    /// At least one valid frame has arrived recently.
    Streaming,
    /// A valid frame arrived once, but not within `max_stale`.
    Stale,
}

#[derive(Debug)]
pub struct Watchdog {
    state: StreamState,
    last_subscribe_at: Option<Instant>,
    last_frame_at: Option<Instant>,
    last_restart_at: Option<Instant>,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self {
            state: StreamState::NeverSubscribed,
            last_subscribe_at: None,
            last_frame_at: None,
            last_restart_at: None,
        }
    }
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Record a subscribe/resubscribe attempt at `now`.
    pub fn note_subscribed(&mut self, now: Instant) {
        self.last_subscribe_at = Some(now);
        self.last_restart_at = Some(now);
        if self.last_frame_at.is_none() {
            self.state = StreamState::AwaitingFirstFrame;
        }
    }

    /// Record that a valid frame was just decoded.
    pub fn note_frame(&mut self, now: Instant) {
        self.last_frame_at = Some(now);
        self.state = StreamState::Streaming;
    }

    /// Decide whether the watchdog should re-issue the stream subscription
    /// at `now`, given `reader_alive` (is the background reader still
    /// running), `max_stale`, and `restart_cooldown`. Updates `state` to
    /// reflect staleness as a side effect.
    pub fn should_restart(
        &mut self,
        now: Instant,
        reader_alive: bool,
        max_stale: Duration,
        restart_cooldown: Duration,
    ) -> bool {
        let stale = match self.last_frame_at {
            Some(t) => now.saturating_duration_since(t) > max_stale,
            None => false,
        };
        let no_data_yet = self.last_frame_at.is_none()
            && self
                .last_subscribe_at
                .map(|t| now.saturating_duration_since(t) > max_stale)
                .unwrap_or(false);

        if stale && self.state == StreamState::Streaming {
            self.state = StreamState::Stale;
        }

        let should_restart = !reader_alive || stale || no_data_yet;
        if !should_restart {
            return false;
        }
        if let Some(last_restart) = self.last_restart_at {
            if now.saturating_duration_since(last_restart) < restart_cooldown {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_never_subscribed() {
        assert_eq!(Watchdog::new().state(), StreamState::NeverSubscribed);
    }

    #[test]
    fn subscribe_without_frame_is_awaiting_first_frame() {
        let mut wd = Watchdog::new();
        wd.note_subscribed(Instant::now());
        assert_eq!(wd.state(), StreamState::AwaitingFirstFrame);
    }

    #[test]
    fn frame_moves_to_streaming() {
        let mut wd = Watchdog::new();
        let t0 = Instant::now();
        wd.note_subscribed(t0);
        wd.note_frame(t0);
        assert_eq!(wd.state(), StreamState::Streaming);
    }

    #[test]
    fn restarts_when_reader_dead() {
        let mut wd = Watchdog::new();
        let t0 = Instant::now();
        wd.note_subscribed(t0);
        wd.note_frame(t0);
        assert!(wd.should_restart(t0, false, Duration::from_secs(3), Duration::from_secs(2)));
    }

    #[test]
    fn restart_cooldown_suppresses_repeat_restarts() {
        let mut wd = Watchdog::new();
        let t0 = Instant::now();
        wd.note_subscribed(t0);
        // Reader never comes alive, frame never arrives: should_restart fires once,
        // then the cooldown suppresses a second call shortly after.
        assert!(wd.should_restart(t0, false, Duration::from_millis(1), Duration::from_secs(2)));
        wd.note_subscribed(t0);
        assert!(!wd.should_restart(t0, false, Duration::from_millis(1), Duration::from_secs(2)));
    }

    #[test]
    fn stale_after_max_stale_elapsed_with_no_new_frame() {
        let mut wd = Watchdog::new();
        let t0 = Instant::now();
        wd.note_subscribed(t0);
        wd.note_frame(t0);
        let later = t0 + Duration::from_secs(10);
        assert!(wd.should_restart(later, true, Duration::from_secs(3), Duration::from_secs(2)));
        assert_eq!(wd.state(), StreamState::Stale);
    }
}
