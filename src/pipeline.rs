use crate::{
    api::{Detection, PipelineResponse, PlateCrop, detection_success_message},
    detector::{Detector, DetectorConfig, OnnxConfig},
    image::{Image, annotate_image, crop_region, decode_image, encode_jpeg_data_url},
    ocr::RecognitionEngine,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Runs the full detect-crop-recognize pipeline over one image and returns
/// the terminal response. All-or-nothing: any failure between model load and
/// response assembly produces the failure shape, never partial results.
/// Per-crop recognition failures are not failures of the run; they surface
/// as sentinel strings in the affected records.
pub fn run(
    image_path: &Path,
    model_path: Option<PathBuf>,
    engine: &mut RecognitionEngine,
) -> PipelineResponse {
    match run_inner(image_path, model_path, engine) {
        Ok(response) => response,
        Err(error) => {
            info!("Pipeline failed: {error:#}");
            PipelineResponse::failure(format!("{error:#}"))
        }
    }
}

fn run_inner(
    image_path: &Path,
    model_path: Option<PathBuf>,
    engine: &mut RecognitionEngine,
) -> anyhow::Result<PipelineResponse> {
    let mut detector = Detector::new(DetectorConfig {
        onnx_config: OnnxConfig {
            model: model_path,
            ..OnnxConfig::default()
        },
        ..DetectorConfig::default()
    })?;

    let mut decoded_image = Image::default();
    decode_image(image_path, &mut decoded_image)?;
    debug!("Decoded {:?}, {}", image_path, decoded_image);

    let result = detector.detect(&mut decoded_image)?;
    info!(
        "Detected {} license plate(s) in {:?}",
        result.predictions.len(),
        result.processing_time
    );

    let annotated = annotate_image(&decoded_image, &result.predictions)?;
    let annotated_image = encode_jpeg_data_url(&annotated)?;

    let mut detections = Vec::with_capacity(result.predictions.len());
    let mut extracted_plates = Vec::with_capacity(result.predictions.len());
    let mut crop = Image::default();
    for (id, prediction) in result.predictions.iter().enumerate() {
        crop_region(
            &decoded_image,
            prediction.x_min,
            prediction.y_min,
            prediction.x_max,
            prediction.y_max,
            &mut crop,
        )?;

        let extracted_text = match engine.read_plate(&mut crop) {
            Ok(text) => text,
            Err(failure) => {
                debug!("No text for plate {id}: {failure:?}");
                failure.sentinel()
            }
        };
        let plate_image = encode_jpeg_data_url(&crop)?;

        detections.push(Detection {
            confidence: prediction.confidence,
            bbox: [
                prediction.x_min,
                prediction.y_min,
                prediction.x_max,
                prediction.y_max,
            ],
            class_id: prediction.class_id,
            plate_image: plate_image.clone(),
            extracted_text: extracted_text.clone(),
        });
        extracted_plates.push(PlateCrop {
            id,
            confidence: prediction.confidence,
            image: plate_image,
            extracted_text,
        });
    }

    let message = detection_success_message(detections.len());
    Ok(PipelineResponse {
        success: true,
        annotated_image: Some(annotated_image),
        detections: Some(detections),
        extracted_plates: Some(extracted_plates),
        error: None,
        message,
    })
}
