use crate::{
    get_object_classes,
    image::{Image, Resizer},
};
use anyhow::{anyhow, bail};
use ndarray::{Array, ArrayView, ArrayView2, Axis, Ix2, s};
use ort::{
    inputs,
    session::{Session, SessionOutputs},
};
use smallvec::SmallVec;
use std::{
    fmt::Debug,
    path::PathBuf,
    time::{Duration, Instant},
};
use tracing::{debug, error, info};

/// Model input resolution. Plate detection models are exported at 640x640.
const INPUT_SIZE: usize = 640;
const IOU_THRESHOLD: f32 = 0.5;

/// A detected box in source-image pixel coordinates, clamped to the raster
/// so that x_min < x_max and y_min < y_max always hold.
#[derive(Clone, PartialEq)]
pub struct Prediction {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
    pub confidence: f32,
    pub class_id: usize,
    pub label: String,
}

impl Debug for Prediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prediction")
            .field("label", &self.label)
            .field("confidence", &self.confidence)
            .finish()
    }
}

pub struct DetectResult {
    pub predictions: SmallVec<[Prediction; 10]>,
    pub processing_time: Duration,
    pub resize_image_time: Duration,
    pub pre_processing_time: Duration,
    pub inference_time: Duration,
    pub post_processing_time: Duration,
}

impl Debug for DetectResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectResult")
            .field("# predictions", &self.predictions)
            .field("processing_time", &self.processing_time)
            .field("resize_image_time", &self.resize_image_time)
            .field("pre_processing_time", &self.pre_processing_time)
            .field("inference_time", &self.inference_time)
            .field("post_processing_time", &self.post_processing_time)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct OnnxConfig {
    pub intra_threads: usize,
    pub inter_threads: usize,
    pub model: Option<PathBuf>,
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            intra_threads: 192,
            inter_threads: 192,
            model: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub object_classes: Option<PathBuf>,
    pub confidence_threshold: f32,
    pub onnx_config: OnnxConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            object_classes: None,
            confidence_threshold: 0.25,
            onnx_config: OnnxConfig::default(),
        }
    }
}

pub struct Detector {
    session: Session,
    resizer: Resizer,
    resized_image: Image,
    object_classes: Vec<String>,
    input: ndarray::ArrayBase<ndarray::OwnedRepr<f32>, ndarray::Dim<[usize; 4]>>,
    confidence_threshold: f32,
    model_name: String,
}

impl Detector {
    pub fn new(detector_config: DetectorConfig) -> anyhow::Result<Self> {
        let object_classes = get_object_classes(detector_config.object_classes)?;
        let (model_name, session) = initialize_onnx(&detector_config.onnx_config)?;

        info!(
            "Initialized detector with model {:?} and {} object class(es)",
            model_name,
            object_classes.len()
        );

        Ok(Self {
            session,
            resizer: Resizer::default(),
            resized_image: Image::default(),
            object_classes,
            input: Array::zeros((1, 3, INPUT_SIZE, INPUT_SIZE)),
            confidence_threshold: detector_config.confidence_threshold,
            model_name,
        })
    }

    /// Runs one detection pass over the whole raster. Predictions come back
    /// in post-processing output order; callers must not re-sort them.
    pub fn detect(&mut self, decoded_image: &mut Image) -> anyhow::Result<DetectResult> {
        let processing_time_start = Instant::now();

        let resize_factor_x = decoded_image.width as f32 / INPUT_SIZE as f32;
        let resize_factor_y = decoded_image.height as f32 / INPUT_SIZE as f32;
        let resize_image_start_time = Instant::now();
        self.resizer
            .resize_image(decoded_image, &mut self.resized_image)?;
        let resize_image_time = resize_image_start_time.elapsed();
        debug!("Resize image time: {:?}", resize_image_time);

        let copy_pixels_to_input_start = Instant::now();
        for (index, chunk) in self.resized_image.pixels.chunks_exact(3).enumerate() {
            let y = index / INPUT_SIZE;
            let x = index % INPUT_SIZE;
            self.input[[0, 0, y, x]] = chunk[0] as f32 / 255.0;
            self.input[[0, 1, y, x]] = chunk[1] as f32 / 255.0;
            self.input[[0, 2, y, x]] = chunk[2] as f32 / 255.0;
        }
        debug!(
            "Copy pixels to input time: {:?}",
            copy_pixels_to_input_start.elapsed()
        );

        let pre_processing_time = processing_time_start.elapsed();
        let start_inference_time = Instant::now();
        let outputs: SessionOutputs = self.session.run(inputs!["images" => self.input.view()]?)?;
        let inference_time = start_inference_time.elapsed();
        debug!("Inference time: {:?}", inference_time);

        let post_processing_time_start = Instant::now();
        let output = outputs
            .values()
            .next()
            .ok_or_else(|| anyhow!("Detection model returned no outputs"))?;
        let output: ArrayView<f32, _> = output.try_extract_tensor::<f32>()?;
        let output = output.index_axis(Axis(0), 0).into_dimensionality::<Ix2>()?;
        let predictions = yolo_post_process(
            output,
            self.confidence_threshold,
            resize_factor_x,
            resize_factor_y,
            decoded_image.width as f32,
            decoded_image.height as f32,
            &self.object_classes,
        )?;

        let now = Instant::now();
        let post_processing_time = now.duration_since(post_processing_time_start);
        let processing_time = now.duration_since(processing_time_start);
        debug!("Post-processing time: {:?}", post_processing_time);
        debug!("Processing time: {:?}", processing_time);

        Ok(DetectResult {
            predictions,
            processing_time,
            resize_image_time,
            pre_processing_time,
            inference_time,
            post_processing_time,
        })
    }

    pub fn get_model_name(&self) -> &String {
        &self.model_name
    }
}

fn initialize_onnx(onnx_config: &OnnxConfig) -> anyhow::Result<(String, Session)> {
    let physical_cores = num_cpus::get_physical().saturating_sub(1).max(1);
    let num_intra_threads = onnx_config.intra_threads.min(physical_cores);
    let num_inter_threads = onnx_config.inter_threads.min(physical_cores);
    info!(
        "Running inference on CPU with {} intra and {} inter threads",
        num_intra_threads, num_inter_threads
    );

    let model_path = onnx_config
        .model
        .clone()
        .unwrap_or_else(|| PathBuf::from(crate::DEFAULT_MODEL_FILE_NAME));
    let model_name = model_path.display().to_string();
    let Ok(model_bytes) = std::fs::read(&model_path) else {
        error!(
            "Failed to read model file: {:?} ensure you either specify a model or that {} is in the working directory",
            model_path,
            crate::DEFAULT_MODEL_FILE_NAME
        );
        bail!("Failed to read model file {}", model_path.display());
    };

    let session = Session::builder()?
        .with_intra_threads(num_intra_threads)?
        .with_inter_threads(num_inter_threads)?
        .commit_from_memory(model_bytes.as_slice())?;

    Ok((model_name, session))
}

/// Converts raw YOLO rows (x_center, y_center, width, height, objectness,
/// per-class scores) into clamped predictions, then suppresses overlapping
/// boxes.
fn yolo_post_process(
    output: ArrayView2<f32>,
    confidence_threshold: f32,
    resize_factor_x: f32,
    resize_factor_y: f32,
    image_width: f32,
    image_height: f32,
    object_classes: &[String],
) -> anyhow::Result<SmallVec<[Prediction; 10]>> {
    if output.shape()[1] != 5 + object_classes.len() {
        bail!(
            "Unexpected model output shape, expected {} columns, got {}. This probably means that your classes YAML file does not match the model.",
            5 + object_classes.len(),
            output.shape()[1]
        );
    }

    let mut predictions = SmallVec::<[Prediction; 10]>::new();

    for row in output.outer_iter() {
        if row[4] > confidence_threshold {
            let class_id = row
                .slice(s![5..])
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(idx, _)| idx)
                .unwrap_or(0);

            let x_center = row[0] * resize_factor_x;
            let y_center = row[1] * resize_factor_y;
            let width = row[2] * resize_factor_x;
            let height = row[3] * resize_factor_y;

            let x_min = (x_center - width / 2.0).clamp(0.0, image_width);
            let x_max = (x_center + width / 2.0).clamp(0.0, image_width);
            let y_min = (y_center - height / 2.0).clamp(0.0, image_height);
            let y_max = (y_center + height / 2.0).clamp(0.0, image_height);

            if x_min >= x_max || y_min >= y_max {
                continue;
            }

            let prediction = Prediction {
                x_min,
                y_min,
                x_max,
                y_max,
                confidence: row[4].clamp(0.0, 1.0),
                class_id,
                label: object_classes[class_id].clone(),
            };
            predictions.push(prediction);
        }
    }

    let predictions = non_maximum_suppression(predictions, IOU_THRESHOLD)?;

    for (i, prediction) in predictions.iter().enumerate() {
        debug!("Prediction - {}: {:?}", i + 1, prediction);
    }

    Ok(predictions)
}

fn non_maximum_suppression(
    mut predictions: SmallVec<[Prediction; 10]>,
    iou_threshold: f32,
) -> anyhow::Result<SmallVec<[Prediction; 10]>> {
    let mut filtered_predictions = SmallVec::new();

    predictions.sort_by(|a, b| {
        a.label
            .cmp(&b.label)
            .then(b.confidence.total_cmp(&a.confidence))
    });

    let mut current_class = None;
    let mut kept: SmallVec<[Prediction; 10]> = SmallVec::new();

    for pred in predictions.iter() {
        if Some(&pred.label) != current_class {
            for kept_pred in kept.iter() {
                filtered_predictions.push(kept_pred.clone());
            }
            kept.clear();
            current_class = Some(&pred.label);
        }
        let mut should_keep = true;
        for kept_pred in kept.iter() {
            if calculate_iou(pred, kept_pred) >= iou_threshold {
                should_keep = false;
                break;
            }
        }

        if should_keep {
            kept.push(pred.clone());
        }
    }

    for kept_pred in kept.iter() {
        filtered_predictions.push(kept_pred.clone());
    }

    Ok(filtered_predictions)
}

fn calculate_iou(a: &Prediction, b: &Prediction) -> f32 {
    let x_min = a.x_min.max(b.x_min);
    let y_min = a.y_min.max(b.y_min);
    let x_max = a.x_max.min(b.x_max);
    let y_max = a.y_max.min(b.y_max);
    let intersection = (x_max - x_min).max(0.0) * (y_max - y_min).max(0.0);
    let area_a = (a.x_max - a.x_min) * (a.y_max - a.y_min);
    let area_b = (b.x_max - b.x_min) * (b.y_max - b.y_min);
    let union = area_a + area_b - intersection;

    if union == 0.0 { 0.0 } else { intersection / union }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn plate(x_min: f32, y_min: f32, x_max: f32, y_max: f32, confidence: f32) -> Prediction {
        Prediction {
            x_min,
            y_min,
            x_max,
            y_max,
            confidence,
            class_id: 0,
            label: "license_plate".to_string(),
        }
    }

    #[test]
    fn test_iou_disjoint_boxes_is_zero() {
        let a = plate(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = plate(20.0, 20.0, 30.0, 30.0, 0.9);
        assert_eq!(calculate_iou(&a, &b), 0.0);
    }

    #[test]
    fn test_iou_identical_boxes_is_one() {
        let a = plate(5.0, 5.0, 15.0, 25.0, 0.9);
        assert!((calculate_iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_drops_overlapping_lower_confidence_box() {
        let mut predictions = SmallVec::<[Prediction; 10]>::new();
        predictions.push(plate(0.0, 0.0, 10.0, 10.0, 0.6));
        predictions.push(plate(1.0, 1.0, 11.0, 11.0, 0.9));
        predictions.push(plate(50.0, 50.0, 60.0, 60.0, 0.5));

        let kept = non_maximum_suppression(predictions, 0.5).unwrap();
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_post_process_thresholds_and_clamps() {
        // Two rows in model space: one confident box hanging off the left
        // edge, one below the confidence threshold.
        let rows = vec![
            10.0, 320.0, 40.0, 20.0, 0.8, 0.9, //
            320.0, 320.0, 40.0, 20.0, 0.1, 0.9,
        ];
        let output = Array2::from_shape_vec((2, 6), rows).unwrap();
        let classes = vec!["license_plate".to_string()];

        let predictions =
            yolo_post_process(output.view(), 0.25, 1.0, 1.0, 640.0, 640.0, &classes).unwrap();
        assert_eq!(predictions.len(), 1);
        let prediction = &predictions[0];
        assert_eq!(prediction.x_min, 0.0);
        assert!(prediction.x_min < prediction.x_max);
        assert!(prediction.y_min < prediction.y_max);
        assert_eq!(prediction.class_id, 0);
        assert_eq!(prediction.label, "license_plate");
        assert!((0.0..=1.0).contains(&prediction.confidence));
    }

    #[test]
    fn test_post_process_rejects_mismatched_class_count() {
        let output = Array2::from_shape_vec((1, 6), vec![0.0; 6]).unwrap();
        let classes = vec!["a".to_string(), "b".to_string()];
        assert!(
            yolo_post_process(output.view(), 0.25, 1.0, 1.0, 640.0, 640.0, &classes).is_err()
        );
    }

    #[test]
    fn test_post_process_scales_to_source_resolution() {
        // 1280x960 source image, factors 2.0 and 1.5
        let rows = vec![100.0, 100.0, 50.0, 30.0, 0.9, 0.9];
        let output = Array2::from_shape_vec((1, 6), rows).unwrap();
        let classes = vec!["license_plate".to_string()];

        let predictions =
            yolo_post_process(output.view(), 0.25, 2.0, 1.5, 1280.0, 960.0, &classes).unwrap();
        assert_eq!(predictions.len(), 1);
        let prediction = &predictions[0];
        assert!((prediction.x_min - 150.0).abs() < 1e-3);
        assert!((prediction.x_max - 250.0).abs() < 1e-3);
        assert!((prediction.y_min - 127.5).abs() < 1e-3);
        assert!((prediction.y_max - 172.5).abs() < 1e-3);
    }
}
