//! Background fiducial marker detector (§4.5 `MarkerDetector`).
//!
//! Runs detection on a dedicated thread fed by a bounded queue (capacity
//! 2, drop-oldest on overflow) so a slow detector never backs up the
//! camera pipeline. Detector construction and per-frame failures are
//! carried as data on the result, never a panic or a blocked caller.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use tracing::{debug, warn};
use types::MarkerDetection;

use crate::backend::{AprilTagBackend, DetectError, MarkerBackend};

const QUEUE_CAPACITY: usize = 2;
const WORKER_POLL: Duration = Duration::from_millis(200);
const UPSCALE_BELOW_PX: u32 = 1000;
/// `image::imageops::contrast`'s stretch factor for the final retry
/// attempt; stands in for the original detector's CLAHE pass (no CLAHE
/// equivalent exists in `image`, so a global contrast stretch is the
/// closest same-crate approximation).
const CONTRAST_ENHANCE_FACTOR: f32 = 30.0;

/// One completed (or failed) detection pass.
#[derive(Debug, Clone, Default)]
pub struct DetectionResult {
    pub ok: bool,
    pub enabled: bool,
    pub reason: String,
    pub markers: Vec<MarkerDetection>,
    pub timestamp: Option<DateTime<Utc>>,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl DetectionResult {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            enabled: true,
            reason: reason.into(),
            ..Default::default()
        }
    }
}

/// Point-in-time operational status, for a telemetry status object.
#[derive(Debug, Clone)]
pub struct DetectorStatus {
    pub enabled: bool,
    pub interval_sec: f64,
    pub dictionary: String,
    pub worker_alive: bool,
    pub queue_len: usize,
}

type ResultCallback = Arc<dyn Fn(&DetectionResult) + Send + Sync>;

struct BoundedQueue {
    items: Mutex<VecDeque<Vec<u8>>>,
    not_empty: Condvar,
}

impl BoundedQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            not_empty: Condvar::new(),
        }
    }

    fn push(&self, frame: Vec<u8>) {
        let mut items = self.items.lock().unwrap();
        if items.len() >= QUEUE_CAPACITY {
            items.pop_front();
        }
        items.push_back(frame);
        self.not_empty.notify_one();
    }

    fn pop_wait(&self, timeout: Duration) -> Option<Vec<u8>> {
        let items = self.items.lock().unwrap();
        let (mut items, _) = self
            .not_empty
            .wait_timeout_while(items, timeout, |q| q.is_empty())
            .unwrap();
        items.pop_front()
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

struct Shared {
    queue: BoundedQueue,
    last_result: Mutex<DetectionResult>,
    last_result_at: Mutex<Option<Instant>>,
    result_callback: Mutex<Option<ResultCallback>>,
    stop: std::sync::atomic::AtomicBool,
}

/// Background detector: `enqueue_jpeg_frame` feeds it, `last_result`/
/// `status` read it back.
#[derive(Clone)]
pub struct MarkerDetector {
    enabled: bool,
    interval_sec: f64,
    dictionary: String,
    shared: Arc<Shared>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MarkerDetector {
    pub fn new(enabled: bool, interval_sec: f64, dictionary: impl Into<String>) -> Self {
        let interval_sec = interval_sec.max(0.2);
        let dictionary = dictionary.into();
        let initial = DetectionResult {
            ok: false,
            enabled,
            reason: if enabled { "idle".to_string() } else { "disabled".to_string() },
            ..Default::default()
        };
        Self {
            enabled,
            interval_sec,
            dictionary,
            shared: Arc::new(Shared {
                queue: BoundedQueue::new(),
                last_result: Mutex::new(initial),
                last_result_at: Mutex::new(None),
                result_callback: Mutex::new(None),
                stop: std::sync::atomic::AtomicBool::new(false),
            }),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_result_callback<F>(&self, callback: F)
    where
        F: Fn(&DetectionResult) + Send + Sync + 'static,
    {
        *self.shared.result_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Build the native backend and spawn the worker thread. A no-op if
    /// disabled or already running. Backend construction failure (e.g. an
    /// unsupported dictionary) is recorded on the status rather than
    /// returned — the caller reads it back via `last_result`.
    pub fn start(&self) {
        if !self.enabled {
            return;
        }
        let mut worker = self.worker.lock().unwrap();
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.shared.stop.store(false, std::sync::atomic::Ordering::SeqCst);

        let backend = AprilTagBackend::new(&self.dictionary);
        let shared = self.shared.clone();
        match backend {
            Ok(backend) => {
                *worker = Some(std::thread::spawn(move || worker_loop(shared, backend)));
            }
            Err(err) => {
                warn!(%err, "marker detector backend unavailable");
                *shared.last_result.lock().unwrap() = DetectionResult::failed(err.to_string());
            }
        }
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.shared.queue.items.lock().unwrap().clear();
    }

    pub fn enqueue_jpeg_frame(&self, frame: Vec<u8>) {
        if !self.enabled || frame.is_empty() {
            return;
        }
        self.shared.queue.push(frame);
    }

    /// The most recent detection result, downgraded to `stale` if no
    /// detection has completed within `max(1.5s, 2.5 * interval_sec)`.
    pub fn last_result(&self) -> DetectionResult {
        let result = self.shared.last_result.lock().unwrap().clone();
        let age = self.shared.last_result_at.lock().unwrap().map(|at| at.elapsed());
        let stale_after = Duration::from_secs_f64(1.5_f64.max(self.interval_sec * 2.5));
        match (self.enabled, age) {
            (true, Some(age)) if age > stale_after => DetectionResult {
                ok: false,
                enabled: true,
                reason: "stale".to_string(),
                markers: Vec::new(),
                timestamp: result.timestamp,
                frame_width: result.frame_width,
                frame_height: result.frame_height,
            },
            _ => result,
        }
    }

    pub fn status(&self) -> DetectorStatus {
        DetectorStatus {
            enabled: self.enabled,
            interval_sec: self.interval_sec,
            dictionary: self.dictionary.clone(),
            worker_alive: self
                .worker
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(|h| !h.is_finished()),
            queue_len: self.shared.queue.len(),
        }
    }
}

fn worker_loop(shared: Arc<Shared>, mut backend: AprilTagBackend) {
    while !shared.stop.load(std::sync::atomic::Ordering::SeqCst) {
        let Some(frame) = shared.queue.pop_wait(WORKER_POLL) else {
            continue;
        };
        let result = detect_one(&mut backend, &frame);
        *shared.last_result.lock().unwrap() = result.clone();
        *shared.last_result_at.lock().unwrap() = Some(Instant::now());
        if let Some(callback) = shared.result_callback.lock().unwrap().clone() {
            callback(&result);
        }
    }
}

/// Decode one JPEG and run up to three detection attempts, in order: the
/// frame as decoded; (when the shorter side is small) a 2x upscaled
/// variant with detections scaled back to original-frame pixels; and a
/// contrast-enhanced variant of the original-resolution frame. Stops at
/// the first attempt that yields any marker.
fn detect_one(backend: &mut AprilTagBackend, jpeg: &[u8]) -> DetectionResult {
    let decoded = match image::load_from_memory(jpeg) {
        Ok(img) => img,
        Err(err) => {
            debug!(%err, "jpeg decode failed");
            return DetectionResult::failed("decode_failed");
        }
    };
    let gray = decoded.to_luma8();
    let (width, height) = gray.dimensions();

    let mut attempts: Vec<(image::GrayImage, f64)> = vec![(gray.clone(), 1.0)];
    if width.min(height) <= UPSCALE_BELOW_PX {
        let upscaled = image::imageops::resize(&gray, width * 2, height * 2, FilterType::CatmullRom);
        attempts.push((upscaled, 0.5));
    }
    attempts.push((image::imageops::contrast(&gray, CONTRAST_ENHANCE_FACTOR), 1.0));

    for (image, scale_back) in attempts {
        match backend.detect(&image) {
            Ok(markers) => {
                let markers = if scale_back != 1.0 {
                    markers.into_iter().map(|m| scale_detection(m, scale_back)).collect()
                } else {
                    markers
                };
                if markers.is_empty() {
                    continue;
                }
                return DetectionResult {
                    ok: true,
                    enabled: true,
                    reason: "detected".to_string(),
                    markers,
                    timestamp: Some(Utc::now()),
                    frame_width: width,
                    frame_height: height,
                };
            }
            Err(DetectError::DetectorUnavailable(reason)) => {
                return DetectionResult::failed(format!("detector_unavailable:{reason}"));
            }
            Err(err) => {
                debug!(%err, "detect attempt failed, trying next variant");
            }
        }
    }

    DetectionResult {
        ok: true,
        enabled: true,
        reason: "detected".to_string(),
        markers: Vec::new(),
        timestamp: Some(Utc::now()),
        frame_width: width,
        frame_height: height,
    }
}

fn scale_detection(mut marker: MarkerDetection, scale: f64) -> MarkerDetection {
    for corner in &mut marker.corners {
        corner.0 *= scale;
        corner.1 *= scale;
    }
    marker.center.0 *= scale;
    marker.center.1 *= scale;
    marker.area_px *= scale * scale;
    marker
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_detector_never_enqueues() {
        let detector = MarkerDetector::new(false, 1.0, "DICT_APRILTAG_36h11");
        detector.enqueue_jpeg_frame(vec![1, 2, 3]);
        assert_eq!(detector.status().queue_len, 0);
    }

    #[test]
    fn start_on_unsupported_dictionary_records_failure_without_spawning() {
        let detector = MarkerDetector::new(true, 1.0, "DICT_4X4_50");
        detector.start();
        let result = detector.last_result();
        assert!(!result.ok);
        assert!(result.reason.starts_with("detector_unavailable") || result.reason.contains("unsupported_dictionary"));
        assert!(!detector.status().worker_alive);
    }

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let queue = BoundedQueue::new();
        queue.push(vec![1]);
        queue.push(vec![2]);
        queue.push(vec![3]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_wait(Duration::from_millis(1)), Some(vec![2]));
        assert_eq!(queue.pop_wait(Duration::from_millis(1)), Some(vec![3]));
    }

    #[test]
    fn interval_is_floored_at_200ms() {
        let detector = MarkerDetector::new(true, 0.01, "DICT_APRILTAG_36h11");
        assert_eq!(detector.status().interval_sec, 0.2);
    }
}
