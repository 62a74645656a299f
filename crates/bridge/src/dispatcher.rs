//! Typed command dispatch with the bumper safety guard (§4.7 `ControlDispatcher`).
//!
//! Pure with respect to networking: `handle` takes a decoded `Command` and
//! returns a structured `Ack`/`CommandError`, leaving transport (the
//! websocket accept loop in `server`) to decide how a command got here and
//! how the reply goes back out.

use robot::{RobotDriver, RADIUS_INPLACE_CCW, RADIUS_INPLACE_CW, RADIUS_STRAIGHT};
use tracing::{info, warn};
use types::{Ack, Command, CommandError};

/// Dispatches decoded commands onto a `RobotDriver`, applying the bumper
/// safety guard to every `drive`/`stop` call.
#[derive(Clone)]
pub struct ControlDispatcher {
    driver: RobotDriver,
}

impl ControlDispatcher {
    pub fn new(driver: RobotDriver) -> Self {
        Self { driver }
    }

    pub fn handle(&self, command: Command) -> Result<Ack, CommandError> {
        match command {
            Command::Ping => Ok(Ack {
                ok: true,
                action: "ping".to_string(),
                connected: Some(self.driver.is_connected()),
                ..Ack::default()
            }),
            Command::Init => self.handle_init(),
            Command::Mode { value } => self.handle_mode(&value),
            Command::Drive { velocity, radius } => self.handle_drive(velocity, radius),
            Command::Stop => self.handle_drive(0, RADIUS_STRAIGHT),
            Command::Clean => self
                .driver
                .clean()
                .map(|()| simple_ack("clean"))
                .map_err(link_closed),
            Command::Dock => self
                .driver
                .dock()
                .map(|()| simple_ack("dock"))
                .map_err(link_closed),
        }
    }

    /// `init` is idempotent: issuing it repeatedly against an already-open
    /// link just re-sends `start`/`safe`/subscribe rather than erroring.
    fn handle_init(&self) -> Result<Ack, CommandError> {
        self.driver.start().map_err(link_closed)?;
        self.driver.safe().map_err(link_closed)?;
        self.driver
            .subscribe(robot::DEFAULT_STREAM_PACKET_IDS.as_slice())
            .map_err(link_closed)?;
        info!("control dispatcher: init complete");
        Ok(Ack {
            ok: true,
            action: "init".to_string(),
            connected: Some(self.driver.is_connected()),
            ..Ack::default()
        })
    }

    fn handle_mode(&self, value: &str) -> Result<Ack, CommandError> {
        let result = match value {
            "safe" => self.driver.safe(),
            "full" => self.driver.full(),
            other => return Err(CommandError::new(format!("invalid mode: {other}"))),
        };
        result.map_err(link_closed)?;
        Ok(Ack {
            ok: true,
            action: "mode".to_string(),
            connected: Some(self.driver.is_connected()),
            mode: Some(value.to_string()),
            ..Ack::default()
        })
    }

    fn handle_drive(&self, velocity: i32, radius: i32) -> Result<Ack, CommandError> {
        let telemetry = self.driver.telemetry();
        let (eff_velocity, eff_radius, guarded, reason) =
            apply_bumper_guard(telemetry.bump_left, telemetry.bump_right, velocity, radius);
        if guarded {
            warn!(reason, velocity, radius, "drive command guarded by bumper latch");
        }
        let (sent_velocity, sent_radius) = self.driver.drive(eff_velocity, eff_radius).map_err(link_closed)?;
        Ok(Ack {
            ok: true,
            action: "drive".to_string(),
            connected: Some(self.driver.is_connected()),
            velocity: Some(sent_velocity),
            radius: Some(sent_radius),
            guarded: Some(guarded),
            guard_reason: reason.map(str::to_string),
            ..Ack::default()
        })
    }
}

fn simple_ack(action: &str) -> Ack {
    Ack {
        ok: true,
        action: action.to_string(),
        ..Ack::default()
    }
}

fn link_closed<E: std::fmt::Display>(err: E) -> CommandError {
    CommandError::new(format!("link_closed: {err}"))
}

/// Bumper safety guard (§4.7). Returns the `(velocity, radius)` actually
/// allowed through, whether it was guarded, and the reason code when it was.
fn apply_bumper_guard(
    bump_left: bool,
    bump_right: bool,
    velocity: i32,
    radius: i32,
) -> (i32, i32, bool, Option<&'static str>) {
    if bump_left && bump_right {
        if velocity < 0 {
            return (velocity, radius, false, None);
        }
        return (0, RADIUS_STRAIGHT, true, Some("both_bumpers_block_forward"));
    }
    if bump_left {
        if velocity < 0 || radius == RADIUS_INPLACE_CW {
            return (velocity, radius, false, None);
        }
        return (0, RADIUS_STRAIGHT, true, Some("left_bumper_block_forward"));
    }
    if bump_right {
        if velocity < 0 || radius == RADIUS_INPLACE_CCW {
            return (velocity, radius, false, None);
        }
        return (0, RADIUS_STRAIGHT, true, Some("right_bumper_block_forward"));
    }
    (velocity, radius, false, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher_with_closed_link() -> ControlDispatcher {
        ControlDispatcher::new(RobotDriver::new(link::SerialLink::closed_for_test()))
    }

    #[test]
    fn ping_reports_disconnected_without_erroring() {
        let dispatcher = dispatcher_with_closed_link();
        let ack = dispatcher.handle(Command::Ping).expect("ping never fails");
        assert_eq!(ack.action, "ping");
        assert_eq!(ack.connected, Some(false));
    }

    #[test]
    fn drive_on_closed_link_surfaces_link_closed() {
        let dispatcher = dispatcher_with_closed_link();
        let err = dispatcher
            .handle(Command::Drive { velocity: 100, radius: RADIUS_STRAIGHT })
            .unwrap_err();
        assert!(err.error.contains("link_closed"));
    }

    #[test]
    fn invalid_mode_is_rejected() {
        let dispatcher = dispatcher_with_closed_link();
        let err = dispatcher
            .handle(Command::Mode { value: "turbo".to_string() })
            .unwrap_err();
        assert!(err.error.contains("invalid mode"));
    }

    #[test]
    fn both_bumpers_block_non_negative_velocity() {
        let (v, r, guarded, reason) = apply_bumper_guard(true, true, 200, RADIUS_STRAIGHT);
        assert_eq!((v, r), (0, RADIUS_STRAIGHT));
        assert!(guarded);
        assert_eq!(reason, Some("both_bumpers_block_forward"));
    }

    #[test]
    fn both_bumpers_allow_reverse() {
        let (v, r, guarded, reason) = apply_bumper_guard(true, true, -100, RADIUS_STRAIGHT);
        assert_eq!((v, r), (-100, RADIUS_STRAIGHT));
        assert!(!guarded);
        assert_eq!(reason, None);
    }

    #[test]
    fn left_bumper_blocks_forward_but_allows_cw_in_place() {
        let blocked = apply_bumper_guard(true, false, 200, RADIUS_STRAIGHT);
        assert!(blocked.2);
        assert_eq!(blocked.3, Some("left_bumper_block_forward"));

        let allowed_cw = apply_bumper_guard(true, false, 200, RADIUS_INPLACE_CW);
        assert!(!allowed_cw.2);
        assert_eq!((allowed_cw.0, allowed_cw.1), (200, RADIUS_INPLACE_CW));

        let allowed_reverse = apply_bumper_guard(true, false, -50, RADIUS_STRAIGHT);
        assert!(!allowed_reverse.2);
    }

    #[test]
    fn right_bumper_blocks_forward_but_allows_ccw_in_place() {
        let blocked = apply_bumper_guard(false, true, 150, RADIUS_STRAIGHT);
        assert!(blocked.2);
        assert_eq!(blocked.3, Some("right_bumper_block_forward"));

        let allowed_ccw = apply_bumper_guard(false, true, 150, RADIUS_INPLACE_CCW);
        assert!(!allowed_ccw.2);
        assert_eq!((allowed_ccw.0, allowed_ccw.1), (150, RADIUS_INPLACE_CCW));
    }

    #[test]
    fn no_bumpers_pass_through_unguarded() {
        let (v, r, guarded, reason) = apply_bumper_guard(false, false, 300, 100);
        assert_eq!((v, r), (300, 100));
        assert!(!guarded);
        assert_eq!(reason, None);
    }
}
