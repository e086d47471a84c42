use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Message attached to every failure response.
pub static DETECTION_FAILED_MESSAGE: &str = "Erreur lors de la détection";

pub fn detection_success_message(count: usize) -> String {
    format!("Détection réussie - {count} plaque(s) trouvée(s)")
}

/// A single detected license plate, emitted in detector output order.
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct Detection {
    /// Detection confidence in [0,1].
    pub confidence: f32,
    /// Pixel coordinates [x1, y1, x2, y2] with x1 < x2 and y1 < y2.
    pub bbox: [f32; 4],
    /// Class index reported by the detection model.
    #[serde(rename = "class")]
    pub class_id: usize,
    /// The cropped plate region as a JPEG data URL.
    pub plate_image: String,
    /// Recognized plate text, or a sentinel string when recognition
    /// produced nothing usable.
    pub extracted_text: String,
}

impl Debug for Detection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detection")
            .field("confidence", &self.confidence)
            .field("bbox", &self.bbox)
            .field("extracted_text", &self.extracted_text)
            .finish()
    }
}

/// Crop summary paired one-to-one with [`Detection`]; `id` is the index in
/// detection order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PlateCrop {
    pub id: usize,
    pub confidence: f32,
    pub image: String,
    pub extracted_text: String,
}

/// Terminal output of a pipeline run, serialized to stdout as a single JSON
/// document. The failure shape carries only `success`, `error` and `message`.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct PipelineResponse {
    /// True if successful.
    pub success: bool,
    /// The source image with detection boxes drawn, as a JPEG data URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated_image: Option<String>,
    /// One entry per detected box.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detections: Option<Vec<Detection>>,
    /// Crops of the detected boxes with their recognized text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_plates: Option<Vec<PlateCrop>>,
    /// A description of the error if success was false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// A summary of the pipeline run.
    pub message: String,
}

impl PipelineResponse {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            message: DETECTION_FAILED_MESSAGE.to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_shape_has_exactly_three_keys() {
        let response = PipelineResponse::failure("boom");
        let value = serde_json::to_value(&response).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 3);
        assert_eq!(object["success"], false);
        assert_eq!(object["error"], "boom");
        assert_eq!(object["message"], DETECTION_FAILED_MESSAGE);
    }

    #[test]
    fn test_success_shape_has_no_error_key() {
        let response = PipelineResponse {
            success: true,
            annotated_image: Some("data:image/jpeg;base64,".to_string()),
            detections: Some(Vec::new()),
            extracted_plates: Some(Vec::new()),
            error: None,
            message: detection_success_message(0),
        };
        let value = serde_json::to_value(&response).unwrap();
        let object = value.as_object().unwrap();
        assert!(!object.contains_key("error"));
        assert!(object["detections"].as_array().unwrap().is_empty());
        assert!(object["extracted_plates"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_success_message_reflects_count() {
        assert_eq!(
            detection_success_message(0),
            "Détection réussie - 0 plaque(s) trouvée(s)"
        );
        assert!(detection_success_message(3).contains("3 plaque(s)"));
    }

    #[test]
    fn test_detection_serializes_class_field() {
        let detection = Detection {
            confidence: 0.9,
            bbox: [1.0, 2.0, 3.0, 4.0],
            class_id: 0,
            plate_image: String::new(),
            extracted_text: "AB 123 CD".to_string(),
        };
        let value = serde_json::to_value(&detection).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.contains_key("class"));
        assert!(!object.contains_key("class_id"));
    }
}
