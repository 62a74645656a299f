//! Fiducial-marker detection backend (§4.5, §7 `DetectorUnavailable`).
//!
//! `MarkerBackend` is the seam between the detector worker loop and the
//! native detection library, so the worker never has to know whether a
//! detector could be built. `AprilTagBackend` is the concrete
//! implementation, wrapping `apriltag-sys`'s C bindings; building one can
//! fail (missing native lib, unsupported dictionary), and that failure is
//! carried as data rather than a panic, matching the "detector faults
//! never touch the serial control path" rule.

use image::GrayImage;
use thiserror::Error;
use types::MarkerDetection;

#[derive(Error, Debug, Clone)]
pub enum DetectError {
    #[error("jpeg decode failed")]
    DecodeFailed,
    #[error("detector unavailable: {0}")]
    DetectorUnavailable(String),
    #[error("detect error: {0}")]
    DetectError(String),
}

/// Implemented by whatever native library turns a grayscale frame into a
/// list of marker detections.
pub trait MarkerBackend: Send {
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<MarkerDetection>, DetectError>;
}

/// `apriltag-sys`-backed detector. One fiducial "dictionary" maps to one
/// AprilTag tag family; ArUco's own `DICT_APRILTAG_*` entries name exactly
/// these families, which is the dictionary vocabulary this bridge exposes
/// (§6 `aruco_dictionary`).
pub struct AprilTagBackend {
    detector: *mut apriltag_sys::apriltag_detector_t,
    family: *mut apriltag_sys::apriltag_family_t,
    destroy_family: unsafe extern "C" fn(*mut apriltag_sys::apriltag_family_t),
}

// The detector and family pointers are exclusively owned by this struct
// and never shared; apriltag's C API has no implicit thread-local state.
unsafe impl Send for AprilTagBackend {}

impl AprilTagBackend {
    pub fn new(dictionary: &str) -> Result<Self, DetectError> {
        let (create, destroy): (
            unsafe extern "C" fn() -> *mut apriltag_sys::apriltag_family_t,
            unsafe extern "C" fn(*mut apriltag_sys::apriltag_family_t),
        ) = match dictionary {
            "DICT_APRILTAG_16h5" => (apriltag_sys::tag16h5_create, apriltag_sys::tag16h5_destroy),
            "DICT_APRILTAG_25h9" => (apriltag_sys::tag25h9_create, apriltag_sys::tag25h9_destroy),
            "DICT_APRILTAG_36h10" => (apriltag_sys::tag36h10_create, apriltag_sys::tag36h10_destroy),
            "DICT_APRILTAG_36h11" => (apriltag_sys::tag36h11_create, apriltag_sys::tag36h11_destroy),
            other => {
                return Err(DetectError::DetectorUnavailable(format!(
                    "unsupported_dictionary:{other}"
                )))
            }
        };

        unsafe {
            let family = create();
            if family.is_null() {
                return Err(DetectError::DetectorUnavailable(
                    "tag family allocation failed".to_string(),
                ));
            }
            let detector = apriltag_sys::apriltag_detector_create();
            if detector.is_null() {
                destroy(family);
                return Err(DetectError::DetectorUnavailable(
                    "apriltag_detector_create failed".to_string(),
                ));
            }
            apriltag_sys::apriltag_detector_add_family(detector, family);
            Ok(Self {
                detector,
                family,
                destroy_family: destroy,
            })
        }
    }
}

impl Drop for AprilTagBackend {
    fn drop(&mut self) {
        unsafe {
            apriltag_sys::apriltag_detector_destroy(self.detector);
            (self.destroy_family)(self.family);
        }
    }
}

impl MarkerBackend for AprilTagBackend {
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<MarkerDetection>, DetectError> {
        let (width, height) = gray.dimensions();
        unsafe {
            let image = apriltag_sys::image_u8_create(width, height);
            if image.is_null() {
                return Err(DetectError::DetectError("image_u8_create failed".to_string()));
            }
            let stride = (*image).stride as usize;
            let buf = (*image).buf;
            for (y, row) in gray.rows().enumerate() {
                for (x, pixel) in row.enumerate() {
                    *buf.add(y * stride + x) = pixel.0[0];
                }
            }

            let detections = apriltag_sys::apriltag_detector_detect(self.detector, image);
            if detections.is_null() {
                apriltag_sys::image_u8_destroy(image);
                return Err(DetectError::DetectError("apriltag_detector_detect returned null".to_string()));
            }

            let count = apriltag_sys::zarray_size(detections);
            let mut out = Vec::with_capacity(count.max(0) as usize);
            for i in 0..count {
                let mut det_ptr: *mut apriltag_sys::apriltag_detection_t = std::ptr::null_mut();
                apriltag_sys::zarray_get(detections, i, &mut det_ptr as *mut _ as *mut std::ffi::c_void);
                if det_ptr.is_null() {
                    continue;
                }
                let det = &*det_ptr;
                let corners: [(f64, f64); 4] = [
                    (det.p[0][0], det.p[0][1]),
                    (det.p[1][0], det.p[1][1]),
                    (det.p[2][0], det.p[2][1]),
                    (det.p[3][0], det.p[3][1]),
                ];
                let area_px = shoelace_area(&corners);
                out.push(MarkerDetection {
                    id: det.id,
                    corners,
                    center: (det.c[0], det.c[1]),
                    area_px,
                });
            }

            apriltag_sys::apriltag_detections_destroy(detections);
            apriltag_sys::image_u8_destroy(image);
            Ok(out)
        }
    }
}

fn shoelace_area(corners: &[(f64, f64); 4]) -> f64 {
    let mut sum = 0.0;
    for i in 0..4 {
        let (x1, y1) = corners[i];
        let (x2, y2) = corners[(i + 1) % 4];
        sum += x1 * y2 - x2 * y1;
    }
    (sum / 2.0).abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_dictionary_is_reported_not_panicked() {
        let result = AprilTagBackend::new("DICT_4X4_50");
        assert!(matches!(result, Err(DetectError::DetectorUnavailable(_))));
    }

    #[test]
    fn shoelace_area_of_unit_square_is_one() {
        let square = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];
        assert!((shoelace_area(&square) - 1.0).abs() < 1e-9);
    }
}
