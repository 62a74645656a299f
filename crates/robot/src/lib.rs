//! Open Interface protocol driver (§4.2 `RobotDriver`).
//!
//! Owns a `link::SerialLink`, the command encoder (`protocol`), the sensor
//! frame parser (`frame`), the live telemetry snapshot, the bumper safety
//! latch, and the stream watchdog (`watchdog`). A single non-reentrant
//! mutex guards all of that state; the per-frame callback is invoked after
//! the mutex is released, never while held (§5).

mod frame;
mod protocol;
mod watchdog;

pub use frame::FrameParser;
pub use protocol::{
    DEFAULT_STREAM_PACKET_IDS, RADIUS_INPLACE_CCW, RADIUS_INPLACE_CW, RADIUS_STRAIGHT,
};
pub use watchdog::{StreamState, Watchdog};

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use link::SerialLink;
use thiserror::Error;
use tracing::{debug, warn};
use types::TelemetrySnapshot;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("serial link is closed")]
    LinkClosed,
    #[error("serial I/O error: {0}")]
    Io(link::LinkError),
    #[error("subscription requires at least one packet id")]
    EmptySubscription,
}

impl From<link::LinkError> for DriverError {
    fn from(err: link::LinkError) -> Self {
        match err {
            link::LinkError::Closed => DriverError::LinkClosed,
            other => DriverError::Io(other),
        }
    }
}

type FrameCallback = Arc<dyn Fn(&TelemetrySnapshot) + Send + Sync>;

struct Inner {
    link: SerialLink,
    parser: FrameParser,
    telemetry: TelemetrySnapshot,
    watchdog: Watchdog,
    bump_latch: bool,
    last_issued_velocity: i32,
    stream_packet_ids: Vec<u8>,
}

/// Open Interface command/sensor driver. Cheap to clone (`Arc` internally)
/// so the control dispatcher, broadcaster, and serial reader thread can all
/// hold a handle.
#[derive(Clone)]
pub struct RobotDriver {
    inner: Arc<Mutex<Inner>>,
    frame_callback: Arc<Mutex<Option<FrameCallback>>>,
}

impl RobotDriver {
    pub fn new(link: SerialLink) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                link,
                parser: FrameParser::new(),
                telemetry: TelemetrySnapshot::default(),
                watchdog: Watchdog::new(),
                bump_latch: false,
                last_issued_velocity: 0,
                stream_packet_ids: DEFAULT_STREAM_PACKET_IDS.to_vec(),
            })),
            frame_callback: Arc::new(Mutex::new(None)),
        }
    }

    /// Register the per-frame observer. Invoked with the fresh snapshot
    /// after each successfully decoded frame, never while the driver's
    /// internal mutex is held.
    pub fn set_frame_callback<F>(&self, callback: F)
    where
        F: Fn(&TelemetrySnapshot) + Send + Sync + 'static,
    {
        *self.frame_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().link.is_connected()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        let mut snap = self.inner.lock().unwrap().telemetry.clone();
        snap.roomba_connected = self.is_connected();
        snap
    }

    pub fn stream_state(&self) -> StreamState {
        self.inner.lock().unwrap().watchdog.state()
    }

    fn write(inner: &mut Inner, bytes: &[u8]) -> Result<(), DriverError> {
        inner.link.write(bytes).map_err(DriverError::from)
    }

    pub fn start(&self) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().unwrap();
        Self::write(&mut inner, &protocol::encode_start())
    }

    pub fn safe(&self) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().unwrap();
        Self::write(&mut inner, &protocol::encode_safe())
    }

    pub fn full(&self) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().unwrap();
        Self::write(&mut inner, &protocol::encode_full())
    }

    pub fn clean(&self) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().unwrap();
        Self::write(&mut inner, &protocol::encode_clean())
    }

    pub fn dock(&self) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().unwrap();
        Self::write(&mut inner, &protocol::encode_dock())
    }

    /// Issue a drive command, clamped per §4.2. Returns the clamped
    /// `(velocity, radius)` actually sent.
    pub fn drive(&self, velocity: i32, radius: i32) -> Result<(i32, i32), DriverError> {
        let mut inner = self.inner.lock().unwrap();
        let (bytes, v, r) = protocol::encode_drive(velocity, radius);
        Self::write(&mut inner, &bytes)?;
        inner.last_issued_velocity = v;
        Ok((v, r))
    }

    /// Subscribe to a non-empty set of sensor packet ids; defaults to the
    /// full supported set (§4.2, supplemented per original source: the
    /// subscription is parameterized, not fixed).
    pub fn subscribe(&self, ids: &[u8]) -> Result<(), DriverError> {
        if ids.is_empty() {
            return Err(DriverError::EmptySubscription);
        }
        let mut inner = self.inner.lock().unwrap();
        inner.stream_packet_ids = ids.to_vec();
        Self::write(&mut inner, &protocol::encode_stream_subscribe(ids))?;
        inner.watchdog.note_subscribed(Instant::now());
        Ok(())
    }

    pub fn pause_stream(&self) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().unwrap();
        Self::write(&mut inner, &protocol::encode_stream_pause_resume(false))
    }

    pub fn resume_stream(&self) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().unwrap();
        Self::write(&mut inner, &protocol::encode_stream_pause_resume(true))
    }

    /// Feed newly-read serial bytes into the frame parser. Applies every
    /// complete valid frame in order, running the bumper safety latch and
    /// invoking the per-frame callback (outside the lock) for each one.
    pub fn ingest(&self, bytes: &[u8]) {
        let mut guard = self.inner.lock().unwrap();
        guard.parser.push(bytes);
        loop {
            let Some(payload) = guard.parser.pop_frame() else {
                break;
            };
            if !frame::apply_payload(&payload, &mut guard.telemetry) {
                continue;
            }
            guard.telemetry.timestamp = Utc::now();
            guard.watchdog.note_frame(Instant::now());

            let bump_now = guard.telemetry.bump_left || guard.telemetry.bump_right;
            if !bump_now {
                guard.bump_latch = false;
            } else if !guard.bump_latch && guard.last_issued_velocity > 0 {
                guard.bump_latch = true;
                let (bytes, v, _) = protocol::encode_drive(0, RADIUS_STRAIGHT);
                if let Err(err) = guard.link.write(&bytes) {
                    warn!(?err, "bumper safety stop failed to write");
                } else {
                    guard.last_issued_velocity = v;
                    debug!("bumper safety latch: forced stop");
                }
            }

            let snapshot = guard.telemetry.clone();
            drop(guard);
            if let Some(cb) = self.frame_callback.lock().unwrap().clone() {
                cb(&snapshot);
            }
            guard = self.inner.lock().unwrap();
        }
    }

    /// Service the stream watchdog: re-subscribe if the link is open and
    /// frames have gone stale or never arrived, respecting the restart
    /// cooldown. Returns whether a restart was issued.
    pub fn service_watchdog(
        &self,
        reader_alive: bool,
        max_stale: Duration,
        restart_cooldown: Duration,
    ) -> bool {
        let ids = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.link.is_connected() {
                return false;
            }
            let should = inner.watchdog.should_restart(
                Instant::now(),
                reader_alive,
                max_stale,
                restart_cooldown,
            );
            if !should {
                return false;
            }
            inner.stream_packet_ids.clone()
        };
        match self.subscribe(&ids) {
            Ok(()) => {
                debug!("stream watchdog restarted subscription");
                true
            }
            Err(err) => {
                warn!(?err, "stream watchdog restart failed");
                false
            }
        }
    }

    /// Read whatever bytes are waiting on the link (blocking up to
    /// `max_wait`) and feed them straight into `ingest`. Meant to be
    /// called in a loop from a dedicated blocking reader thread; returns
    /// the byte count so that thread can report liveness to the watchdog.
    pub fn poll_serial(&self, max_wait: Duration) -> Result<usize, DriverError> {
        let bytes = {
            let mut inner = self.inner.lock().unwrap();
            inner.link.read_available(max_wait)?
        };
        let n = bytes.len();
        if n > 0 {
            self.ingest(&bytes);
        }
        Ok(n)
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().link.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn driver_with_closed_link() -> RobotDriver {
        // A link constructed without a real port is the standard way the
        // test suite exercises command-path behavior without a serial
        // device; all writes return `LinkClosed`, matching production
        // behavior for a disconnected robot.
        RobotDriver::new(link::SerialLink::closed_for_test())
    }

    #[test]
    fn drive_clamps_and_records_last_velocity() {
        let driver = driver_with_closed_link();
        let result = driver.drive(9000, RADIUS_STRAIGHT);
        assert!(matches!(result, Err(DriverError::LinkClosed)));
    }

    #[test]
    fn subscribe_rejects_empty_ids() {
        let driver = driver_with_closed_link();
        assert!(matches!(
            driver.subscribe(&[]),
            Err(DriverError::EmptySubscription)
        ));
    }

    #[test]
    fn ingest_invokes_callback_once_per_frame() {
        let driver = driver_with_closed_link();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        driver.set_frame_callback(move |_snapshot| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        let mut frame = vec![0x13, 0x02, 8, 0x01];
        let sum: u8 = frame.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        frame.push(0u8.wrapping_sub(sum));

        let mut batch = frame.clone();
        batch.extend(frame.clone());
        driver.ingest(&batch);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(driver.telemetry().wall_seen);
    }

    #[test]
    fn ingest_never_applies_a_bad_checksum_frame() {
        let driver = driver_with_closed_link();
        let mut frame = vec![0x13, 0x02, 8, 0x01, 0xFF];
        frame[4] ^= 0x01; // corrupt
        driver.ingest(&frame);
        assert!(!driver.telemetry().wall_seen);
    }

    #[test]
    fn bumper_latch_clears_once_both_bumps_are_zero() {
        let driver = driver_with_closed_link();
        // No prior positive drive velocity, so no synthesized stop is
        // expected, but the bump flags themselves must still decode.
        let payload = [7u8, 0x03];
        let mut frame = vec![0x13, payload.len() as u8];
        frame.extend_from_slice(&payload);
        let sum: u8 = frame.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        frame.push(0u8.wrapping_sub(sum));
        driver.ingest(&frame);
        assert!(driver.telemetry().bump_left);

        let payload = [7u8, 0x00];
        let mut frame = vec![0x13, payload.len() as u8];
        frame.extend_from_slice(&payload);
        let sum: u8 = frame.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        frame.push(0u8.wrapping_sub(sum));
        driver.ingest(&frame);
        assert!(!driver.telemetry().bump_left);
    }

    #[test]
    fn stream_state_starts_never_subscribed() {
        let driver = driver_with_closed_link();
        assert_eq!(driver.stream_state(), StreamState::NeverSubscribed);
    }

    #[test]
    fn poll_serial_on_closed_link_reports_link_closed() {
        let driver = driver_with_closed_link();
        let result = driver.poll_serial(Duration::from_millis(10));
        assert!(matches!(result, Err(DriverError::LinkClosed)));
    }
}
