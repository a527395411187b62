//! Detector adapter: wraps the object-detection capability behind a stable
//! contract the session controller can hold by composition.
//!
//! The production implementation (`YoloDetector`, feature `ml`) runs a YOLO
//! ONNX model. Loading is construction, so an unloaded detector cannot be
//! invoked by accident; "not ready" only exists at the session level, as the
//! absence of an installed detector.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(feature = "ml")]
use ndarray::{Array, Array3, ArrayView1, Axis};
#[cfg(feature = "ml")]
use ort::session::Session;
#[cfg(feature = "ml")]
use std::time::Instant;
#[cfg(feature = "ml")]
use tracing::{instrument, warn};

use crate::annotate;
use crate::INITIAL_CONFIDENCE;

/// Maximum detections from model output to prevent DoS.
#[cfg(feature = "ml")]
const MAX_MODEL_DETECTIONS: usize = 50_000;

/// Maximum candidates entering NMS to bound CPU time.
#[cfg(any(feature = "ml", test))]
const MAX_NMS_INPUTS: usize = 300;

/// IoU above which the lower-scoring box is suppressed.
#[cfg(feature = "ml")]
const IOU_THRESHOLD: f32 = 0.45;

/// The 24 algae classes the bundled model was trained on, in model order.
pub const ALGAE_CLASSES: [&str; 24] = [
    "anabaena",
    "aphanizomenon",
    "asterionella",
    "ceratium",
    "chlorella",
    "closterium",
    "cosmarium",
    "cyclotella",
    "dinobryon",
    "euglena",
    "fragilaria",
    "gomphonema",
    "melosira",
    "microcystis",
    "navicula",
    "nitzschia",
    "oocystis",
    "oscillatoria",
    "pediastrum",
    "phormidium",
    "scenedesmus",
    "spirogyra",
    "tabellaria",
    "volvox",
];

#[derive(thiserror::Error, Debug, Clone)]
pub enum DetectError {
    #[error("detection model is not loaded")]
    ModelNotReady,

    #[error("invalid image fed to detector: {width}x{height}")]
    InvalidImage { width: u32, height: u32 },

    #[error("inference engine error")]
    Inference(String), // Sanitized - no raw engine errors

    #[error("model configuration mismatch: {0}")]
    ModelMismatch(String),
}

// Manual From impl to sanitize ORT errors
#[cfg(feature = "ml")]
impl From<ort::Error> for DetectError {
    fn from(e: ort::Error) -> Self {
        // Log full error internally, return sanitized version externally
        tracing::error!(error = %e, "ORT inference error");
        DetectError::Inference("internal inference error".into())
    }
}

/// Ordered, fixed-at-load-time mapping from class index to class name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCatalog {
    names: Vec<String>,
}

impl ClassCatalog {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn name(&self, class_id: usize) -> Option<&str> {
        self.names.get(class_id).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// The catalog of the bundled algae model.
#[must_use]
pub fn algae_catalog() -> ClassCatalog {
    ClassCatalog::new(ALGAE_CLASSES)
}

/// One predicted object instance, Pascal-VOC box in absolute pixels of the
/// image handed to `infer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[must_use]
pub struct Detection {
    pub class_name: String,
    /// [x0, y0, x1, y1] corners in pixels
    pub bbox: [f32; 4],
    /// Confidence score (0.0..1.0)
    pub score: f32,
}

/// Everything one inference run produces. `annotated` is a distinct image;
/// the caller's input is never touched.
#[derive(Debug, Clone)]
#[must_use]
pub struct Inference {
    pub detections: Vec<Detection>,
    pub annotated: RgbImage,
}

/// The capability contract the session controller composes with.
///
/// `infer` uses the most recently configured threshold; a detector that was
/// never configured falls back to its initial value.
pub trait Detector: Send {
    fn catalog(&self) -> &ClassCatalog;

    fn configure_threshold(&mut self, threshold: f32);

    /// # Errors
    ///
    /// Returns [`DetectError`] if the image is degenerate or the underlying
    /// engine fails; the input image is left untouched either way.
    fn infer(&self, image: &RgbImage) -> Result<Inference, DetectError>;
}

fn clamp_threshold(threshold: f32) -> f32 {
    if threshold.is_finite() {
        threshold.clamp(f32::EPSILON, 1.0)
    } else {
        INITIAL_CONFIDENCE
    }
}

// ============================================================================
// YoloDetector (feature "ml")
// ============================================================================

/// Model facts extracted and validated at load time.
#[cfg(feature = "ml")]
#[derive(Debug, Clone)]
struct ModelConfig {
    input_height: u32,
    input_width: u32,
    num_classes: usize,
    output_features: usize, // 4 + num_classes
}

#[cfg(feature = "ml")]
struct PreprocessParams {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// YOLO object detector over an ONNX session.
///
/// Inference is serialized through an internal mutex; the session controller
/// is single-threaded anyway, but shells sharing a detector across sessions
/// stay safe.
#[cfg(feature = "ml")]
pub struct YoloDetector {
    session: std::sync::Mutex<Session>,
    config: ModelConfig,
    catalog: ClassCatalog,
    threshold: f32,
}

#[cfg(feature = "ml")]
impl YoloDetector {
    /// Creates a detector from ONNX model bytes and its class catalog.
    ///
    /// # Errors
    ///
    /// Returns [`DetectError::ModelMismatch`] if the model cannot be loaded,
    /// has an unexpected tensor layout, or disagrees with the catalog size.
    #[instrument(skip(model_bytes, catalog), fields(model_size = model_bytes.len()))]
    pub fn new(model_bytes: &[u8], catalog: ClassCatalog) -> Result<Self, DetectError> {
        let session = Session::builder()?.commit_from_memory(model_bytes)?;
        let config = Self::extract_model_config(&session)?;

        if catalog.len() != config.num_classes {
            return Err(DetectError::ModelMismatch(format!(
                "catalog has {} classes, model has {}",
                catalog.len(),
                config.num_classes
            )));
        }

        debug!(
            input_size = %format!("{}x{}", config.input_width, config.input_height),
            num_classes = config.num_classes,
            "Model loaded successfully"
        );

        Ok(Self {
            session: std::sync::Mutex::new(session),
            config,
            catalog,
            threshold: INITIAL_CONFIDENCE,
        })
    }

    /// Convenience constructor for the bundled 24-class algae model.
    ///
    /// # Errors
    ///
    /// Same as [`YoloDetector::new`].
    pub fn algae(model_bytes: &[u8]) -> Result<Self, DetectError> {
        Self::new(model_bytes, algae_catalog())
    }

    /// Extracts configuration from model metadata and validates expectations.
    fn extract_model_config(session: &Session) -> Result<ModelConfig, DetectError> {
        let input = session
            .inputs
            .first()
            .ok_or_else(|| DetectError::ModelMismatch("Model has no inputs".into()))?;

        let input_dims: Vec<i64> = input
            .input_type
            .tensor_dimensions()
            .map(|dims| dims.to_vec())
            .ok_or_else(|| DetectError::ModelMismatch("Input is not a tensor".into()))?;

        // Expected: [batch, channels, height, width]
        if input_dims.len() != 4 {
            return Err(DetectError::ModelMismatch(format!(
                "Expected 4D input, got {}D",
                input_dims.len()
            )));
        }

        let (input_height, input_width) = (input_dims[2] as u32, input_dims[3] as u32);
        if input_height == 0 || input_width == 0 || input_height > 4096 || input_width > 4096 {
            return Err(DetectError::ModelMismatch(format!(
                "Invalid input dimensions: {input_width}x{input_height}"
            )));
        }

        let output = session
            .outputs
            .first()
            .ok_or_else(|| DetectError::ModelMismatch("Model has no outputs".into()))?;

        let output_dims: Vec<i64> = output
            .output_type
            .tensor_dimensions()
            .map(|dims| dims.to_vec())
            .ok_or_else(|| DetectError::ModelMismatch("Output is not a tensor".into()))?;

        // Expected: [1, 4+C, anchors] or [1, anchors, 4+C]
        if output_dims.len() != 3 {
            return Err(DetectError::ModelMismatch(format!(
                "Expected 3D output, got {}D",
                output_dims.len()
            )));
        }

        let output_features = if output_dims[1] < output_dims[2] {
            output_dims[1] as usize
        } else {
            output_dims[2] as usize
        };

        if output_features < 5 {
            return Err(DetectError::ModelMismatch(format!(
                "Output features too small: {output_features}"
            )));
        }

        Ok(ModelConfig {
            input_height,
            input_width,
            num_classes: output_features - 4,
            output_features,
        })
    }

    /// Letterbox resize into the model's input tensor.
    fn preprocess(
        &self,
        image: &RgbImage,
    ) -> Result<(Array<f32, ndarray::Dim<[usize; 4]>>, PreprocessParams), DetectError> {
        let (orig_w, orig_h) = image.dimensions();
        let input_w = self.config.input_width;
        let input_h = self.config.input_height;

        let scale_w = input_w as f32 / orig_w.max(1) as f32;
        let scale_h = input_h as f32 / orig_h.max(1) as f32;
        let scale = scale_w.min(scale_h);

        if !scale.is_finite() || scale <= 0.0 {
            return Err(DetectError::InvalidImage {
                width: orig_w,
                height: orig_h,
            });
        }

        let new_w = ((orig_w as f32) * scale).round() as u32;
        let new_h = ((orig_h as f32) * scale).round() as u32;
        let new_w = new_w.clamp(1, input_w);
        let new_h = new_h.clamp(1, input_h);

        let resized =
            image::imageops::resize(image, new_w, new_h, image::imageops::FilterType::Triangle);

        let pad_x = (input_w - new_w) as f32 / 2.0;
        let pad_y = (input_h - new_h) as f32 / 2.0;

        // Canvas initialized to the YOLO letterbox gray (114/255)
        let mut canvas =
            Array3::<f32>::from_elem((3, input_h as usize, input_w as usize), 114.0 / 255.0);

        let offset_x = pad_x.floor() as usize;
        let offset_y = pad_y.floor() as usize;
        let raw = resized.as_raw();
        let row_px = new_w as usize;

        let copy_h = (new_h as usize).min(input_h as usize - offset_y);
        let copy_w = row_px.min(input_w as usize - offset_x);

        for y in 0..copy_h {
            for x in 0..copy_w {
                let src = (y * row_px + x) * 3;
                canvas[[0, offset_y + y, offset_x + x]] = f32::from(raw[src]) / 255.0;
                canvas[[1, offset_y + y, offset_x + x]] = f32::from(raw[src + 1]) / 255.0;
                canvas[[2, offset_y + y, offset_x + x]] = f32::from(raw[src + 2]) / 255.0;
            }
        }

        Ok((
            canvas.insert_axis(Axis(0)),
            PreprocessParams {
                scale,
                pad_x,
                pad_y,
            },
        ))
    }

    /// Runs the session and normalizes output to `[anchors, features]`.
    fn run_session(
        &self,
        input_tensor: Array<f32, ndarray::Dim<[usize; 4]>>,
    ) -> Result<ndarray::Array2<f32>, DetectError> {
        let input_value = ort::value::Value::from_array(input_tensor)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectError::Inference("session lock poisoned".into()))?;

        let outputs = session.run(ort::inputs![input_value])?;

        let output_tensor = outputs
            .get("output0")
            .or_else(|| outputs.get("output"))
            .ok_or_else(|| DetectError::Inference("model missing output node".into()))?;

        let (shape, data) = output_tensor.try_extract_tensor::<f32>()?;

        if shape.len() != 3 || shape.iter().any(|&dim| dim < 0) {
            return Err(DetectError::Inference(format!(
                "unexpected output shape {shape:?}"
            )));
        }

        let expected_features = self.config.output_features;
        let output_array = if shape[1] as usize == expected_features {
            // [1, 4+C, anchors] -> transpose to [anchors, 4+C]
            let num_anchors = shape[2] as usize;
            if num_anchors > MAX_MODEL_DETECTIONS {
                return Err(DetectError::Inference(format!(
                    "too many anchors: {num_anchors}"
                )));
            }
            ndarray::Array2::from_shape_vec(
                (expected_features, num_anchors),
                data.iter().copied().collect(),
            )
            .map_err(|e| DetectError::Inference(e.to_string()))?
            .t()
            .to_owned()
        } else if shape[2] as usize == expected_features {
            let num_anchors = shape[1] as usize;
            if num_anchors > MAX_MODEL_DETECTIONS {
                return Err(DetectError::Inference(format!(
                    "too many anchors: {num_anchors}"
                )));
            }
            ndarray::Array2::from_shape_vec(
                (num_anchors, expected_features),
                data.iter().copied().collect(),
            )
            .map_err(|e| DetectError::Inference(e.to_string()))?
        } else {
            return Err(DetectError::Inference(format!(
                "feature dimension mismatch: expected {expected_features}, got {shape:?}"
            )));
        };

        Ok(output_array)
    }

    /// Filters candidates at the configured threshold and maps boxes back to
    /// absolute pixel coordinates of the original image.
    fn postprocess(
        &self,
        output: &ndarray::Array2<f32>,
        params: &PreprocessParams,
        orig_w: u32,
        orig_h: u32,
    ) -> Vec<Detection> {
        let mut candidates = Vec::with_capacity(64);

        for row in output.axis_iter(Axis(0)) {
            let row: ArrayView1<f32> = row;

            let (best_class, max_score) = row.iter().skip(4).enumerate().fold(
                (0usize, f32::NEG_INFINITY),
                |(best_idx, best), (idx, &score)| {
                    if score > best {
                        (idx, score)
                    } else {
                        (best_idx, best)
                    }
                },
            );

            if !max_score.is_finite() || max_score < self.threshold {
                continue;
            }

            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            if ![cx, cy, w, h].iter().all(|v| v.is_finite()) || w <= 0.0 || h <= 0.0 {
                continue;
            }

            let x0 = ((cx - w / 2.0) - params.pad_x) / params.scale;
            let y0 = ((cy - h / 2.0) - params.pad_y) / params.scale;
            let x1 = ((cx + w / 2.0) - params.pad_x) / params.scale;
            let y1 = ((cy + h / 2.0) - params.pad_y) / params.scale;
            if ![x0, y0, x1, y1].iter().all(|v| v.is_finite()) {
                continue;
            }

            let bbox = [
                x0.clamp(0.0, orig_w as f32),
                y0.clamp(0.0, orig_h as f32),
                x1.clamp(0.0, orig_w as f32),
                y1.clamp(0.0, orig_h as f32),
            ];
            if (bbox[2] - bbox[0]) < 1.0 || (bbox[3] - bbox[1]) < 1.0 {
                continue;
            }

            let class_name = self
                .catalog
                .name(best_class)
                .map_or_else(|| format!("class_{best_class}"), ToOwned::to_owned);

            candidates.push(Detection {
                class_name,
                bbox,
                score: max_score,
            });
        }

        candidates.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));
        non_max_suppression(candidates, IOU_THRESHOLD)
    }
}

#[cfg(feature = "ml")]
impl Detector for YoloDetector {
    fn catalog(&self) -> &ClassCatalog {
        &self.catalog
    }

    fn configure_threshold(&mut self, threshold: f32) {
        self.threshold = clamp_threshold(threshold);
    }

    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    fn infer(&self, image: &RgbImage) -> Result<Inference, DetectError> {
        let (orig_w, orig_h) = image.dimensions();
        if orig_w == 0 || orig_h == 0 {
            return Err(DetectError::InvalidImage {
                width: orig_w,
                height: orig_h,
            });
        }

        let started = Instant::now();
        let (input_tensor, params) = self.preprocess(image)?;
        let output = self.run_session(input_tensor)?;
        let detections = self.postprocess(&output, &params, orig_w, orig_h);

        if detections.len() == MAX_NMS_INPUTS {
            warn!("detection list hit the NMS input cap; results may be truncated");
        }

        let mut annotated = image.clone();
        annotate::draw_detections(&mut annotated, &detections);

        debug!(
            detections = detections.len(),
            threshold = self.threshold,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "Detection completed"
        );

        Ok(Inference {
            detections,
            annotated,
        })
    }
}

// ============================================================================
// Non-maximum suppression (pixel space)
// ============================================================================

/// Keeps the highest-scoring of overlapping boxes. Input must be sorted by
/// score descending; output preserves that order.
#[cfg(any(feature = "ml", test))]
fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }
    detections.truncate(MAX_NMS_INPUTS);

    let n = detections.len();
    let mut suppressed = vec![false; n];

    let areas: Vec<f32> = detections
        .iter()
        .map(|d| (d.bbox[2] - d.bbox[0]) * (d.bbox[3] - d.bbox[1]))
        .collect();

    for i in 0..n {
        if suppressed[i] {
            continue;
        }
        let box_a = detections[i].bbox;

        for j in (i + 1)..n {
            if suppressed[j] {
                continue;
            }
            let box_b = detections[j].bbox;

            // Quick reject: no intersection possible
            if box_b[0] > box_a[2]
                || box_b[2] < box_a[0]
                || box_b[1] > box_a[3]
                || box_b[3] < box_a[1]
            {
                continue;
            }

            let inter_w = (box_a[2].min(box_b[2]) - box_a[0].max(box_b[0])).max(0.0);
            let inter_h = (box_a[3].min(box_b[3]) - box_a[1].max(box_b[1])).max(0.0);
            let inter_area = inter_w * inter_h;
            let union = areas[i] + areas[j] - inter_area;

            if union > f32::EPSILON && inter_area / union > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    let mut kept = Vec::with_capacity(n);
    for (detection, dropped) in detections.into_iter().zip(suppressed) {
        if !dropped {
            kept.push(detection);
        }
    }
    kept
}

// ============================================================================
// StubDetector
// ============================================================================

/// Scripted detector for tests and headless shells: returns a fixed outcome
/// and records every threshold it was configured with.
pub struct StubDetector {
    catalog: ClassCatalog,
    threshold: f32,
    threshold_log: std::sync::Arc<std::sync::Mutex<Vec<f32>>>,
    script: Result<Vec<Detection>, DetectError>,
}

impl StubDetector {
    #[must_use]
    pub fn returning(detections: Vec<Detection>) -> Self {
        let mut seen: Vec<String> = Vec::new();
        for detection in &detections {
            if !seen.contains(&detection.class_name) {
                seen.push(detection.class_name.clone());
            }
        }
        Self {
            catalog: ClassCatalog::new(seen),
            threshold: INITIAL_CONFIDENCE,
            threshold_log: std::sync::Arc::default(),
            script: Ok(detections),
        }
    }

    #[must_use]
    pub fn failing(error: DetectError) -> Self {
        Self {
            catalog: ClassCatalog::default(),
            threshold: INITIAL_CONFIDENCE,
            threshold_log: std::sync::Arc::default(),
            script: Err(error),
        }
    }

    #[must_use]
    pub fn with_catalog(mut self, catalog: ClassCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Shared handle to the configured-threshold history, in call order.
    #[must_use]
    pub fn threshold_log(&self) -> std::sync::Arc<std::sync::Mutex<Vec<f32>>> {
        std::sync::Arc::clone(&self.threshold_log)
    }
}

impl Detector for StubDetector {
    fn catalog(&self) -> &ClassCatalog {
        &self.catalog
    }

    fn configure_threshold(&mut self, threshold: f32) {
        self.threshold = clamp_threshold(threshold);
        if let Ok(mut log) = self.threshold_log.lock() {
            log.push(self.threshold);
        }
    }

    fn infer(&self, image: &RgbImage) -> Result<Inference, DetectError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectError::InvalidImage { width, height });
        }

        let detections = self.script.clone()?;
        let mut annotated = image.clone();
        annotate::draw_detections(&mut annotated, &detections);
        debug!(detections = detections.len(), "stub inference");
        Ok(Inference {
            detections,
            annotated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(name: &str, bbox: [f32; 4], score: f32) -> Detection {
        Detection {
            class_name: name.to_string(),
            bbox,
            score,
        }
    }

    #[test]
    fn nms_empty() {
        assert!(non_max_suppression(vec![], 0.5).is_empty());
    }

    #[test]
    fn nms_single() {
        let kept = non_max_suppression(vec![det("a", [10.0, 10.0, 50.0, 50.0], 0.9)], 0.5);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn nms_suppresses_overlapping() {
        let kept = non_max_suppression(
            vec![
                det("a", [10.0, 10.0, 50.0, 50.0], 0.9),
                det("a", [12.0, 12.0, 52.0, 52.0], 0.8),
            ],
            0.5,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].score, 0.9);
    }

    #[test]
    fn nms_keeps_disjoint() {
        let kept = non_max_suppression(
            vec![
                det("a", [0.0, 0.0, 20.0, 20.0], 0.9),
                det("a", [80.0, 80.0, 100.0, 100.0], 0.8),
            ],
            0.5,
        );
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn stub_records_thresholds_in_order() {
        let mut stub = StubDetector::returning(vec![]);
        let log = stub.threshold_log();
        for &t in &[0.1, 0.25, 0.5, 0.75, 0.95] {
            stub.configure_threshold(t);
        }
        assert_eq!(*log.lock().unwrap(), vec![0.1, 0.25, 0.5, 0.75, 0.95]);
    }

    #[test]
    fn stub_clamps_nonsense_thresholds() {
        let mut stub = StubDetector::returning(vec![]);
        let log = stub.threshold_log();
        stub.configure_threshold(7.0);
        stub.configure_threshold(f32::NAN);
        let log = log.lock().unwrap();
        assert_eq!(log[0], 1.0);
        assert_eq!(log[1], INITIAL_CONFIDENCE);
    }

    #[test]
    fn stub_does_not_mutate_input() {
        let stub = StubDetector::returning(vec![det("a", [2.0, 2.0, 10.0, 10.0], 0.9)]);
        let image = RgbImage::new(32, 32);
        let before = image.clone();
        let inference = stub.infer(&image).unwrap();
        assert_eq!(image, before);
        assert_ne!(inference.annotated, before);
    }

    #[test]
    fn stub_rejects_degenerate_image() {
        let stub = StubDetector::returning(vec![]);
        let image = RgbImage::new(0, 0);
        assert!(matches!(
            stub.infer(&image),
            Err(DetectError::InvalidImage { .. })
        ));
    }

    #[test]
    fn stub_catalog_derived_from_script() {
        let stub = StubDetector::returning(vec![
            det("diatom", [0.0, 0.0, 5.0, 5.0], 0.9),
            det("volvox", [0.0, 0.0, 5.0, 5.0], 0.8),
            det("diatom", [10.0, 10.0, 15.0, 15.0], 0.7),
        ]);
        let names: Vec<&str> = stub.catalog().iter().collect();
        assert_eq!(names, vec!["diatom", "volvox"]);
    }

    #[test]
    fn algae_catalog_has_24_entries() {
        let catalog = algae_catalog();
        assert_eq!(catalog.len(), 24);
        assert_eq!(catalog.name(22), Some("tabellaria"));
        assert_eq!(catalog.name(24), None);
    }
}
