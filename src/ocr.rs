use crate::image::{Image, Resizer};
use anyhow::{anyhow, bail};
use ndarray::{Array, Axis};
use ort::{
    inputs,
    session::{Session, SessionOutputs},
};
use std::{
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{debug, info, warn};

/// Recognition candidates below this confidence are discarded.
const CONFIDENCE_THRESHOLD: f32 = 0.30;
/// Recognition models take a fixed-height, variable-width input.
const REC_INPUT_HEIGHT: usize = 48;
const MIN_REC_INPUT_WIDTH: usize = 16;
/// Fallback character set when no dictionary file ships with the weights.
/// Index 0 of the model output is the CTC blank, so characters map to
/// class index - 1.
const PLATE_CHARSET: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Why recognition produced no usable text for a crop. Converted to an
/// in-band sentinel string at the serialization boundary so a bad crop never
/// aborts the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionFailure {
    NotAvailable,
    NoCandidates,
    BelowThreshold,
    Engine(String),
}

impl RecognitionFailure {
    pub fn sentinel(&self) -> String {
        match self {
            Self::NotAvailable => {
                "OCR non disponible - modèle de reconnaissance introuvable".to_string()
            }
            Self::NoCandidates => "Aucun texte détecté".to_string(),
            Self::BelowThreshold => {
                "Aucun texte détecté avec confiance suffisante".to_string()
            }
            Self::Engine(error) => format!("Erreur OCR: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub text: String,
    pub confidence: f32,
}

/// Process-wide recognition handle, constructed once at startup. Whether the
/// recognition weights loaded is decided here and checked before every call;
/// an unavailable engine answers every crop with the same failure.
pub enum RecognitionEngine {
    Available(Box<TextRecognizer>),
    Unavailable,
}

impl RecognitionEngine {
    pub fn load(model: PathBuf) -> Self {
        if !model.exists() {
            warn!(
                "Recognition model {:?} not found, plate text extraction is disabled",
                model
            );
            return Self::Unavailable;
        }
        match TextRecognizer::new(&model) {
            Ok(recognizer) => {
                info!("Recognition model {:?} loaded", model);
                Self::Available(Box::new(recognizer))
            }
            Err(error) => {
                warn!(
                    "Failed to load recognition model {:?}: {:#}, plate text extraction is disabled",
                    model, error
                );
                Self::Unavailable
            }
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    /// Recognizes the text on one plate crop. Engine errors are captured in
    /// the failure value, never propagated.
    pub fn read_plate(&mut self, crop: &mut Image) -> Result<String, RecognitionFailure> {
        match self {
            Self::Unavailable => Err(RecognitionFailure::NotAvailable),
            Self::Available(recognizer) => {
                let candidates = recognizer
                    .recognize(crop)
                    .map_err(|error| RecognitionFailure::Engine(format!("{error:#}")))?;
                select_candidates(candidates, CONFIDENCE_THRESHOLD)
            }
        }
    }
}

/// Keeps candidates above the threshold, orders them by descending
/// confidence and joins their texts with single spaces.
pub fn select_candidates(
    mut candidates: Vec<Candidate>,
    threshold: f32,
) -> Result<String, RecognitionFailure> {
    if candidates.is_empty() {
        return Err(RecognitionFailure::NoCandidates);
    }

    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let texts: Vec<&str> = candidates
        .iter()
        .filter(|candidate| candidate.confidence > threshold)
        .map(|candidate| candidate.text.trim())
        .filter(|text| !text.is_empty())
        .collect();

    if texts.is_empty() {
        Err(RecognitionFailure::BelowThreshold)
    } else {
        Ok(texts.join(" "))
    }
}

pub struct TextRecognizer {
    session: Session,
    charset: Vec<char>,
    resized_crop: Image,
}

impl TextRecognizer {
    pub fn new(model: &Path) -> anyhow::Result<Self> {
        let session = Session::builder()?.commit_from_file(model)?;
        let charset = load_charset(model)?;
        Ok(Self {
            session,
            charset,
            resized_crop: Image::default(),
        })
    }

    fn recognize(&mut self, crop: &mut Image) -> anyhow::Result<Vec<Candidate>> {
        if crop.width == 0 || crop.height == 0 {
            bail!("Cannot recognize text on an empty crop");
        }

        // Height-normalized resize, width follows the crop's aspect ratio.
        // The width is dynamic so each crop gets its own resizer.
        let target_width =
            (crop.width * REC_INPUT_HEIGHT / crop.height).max(MIN_REC_INPUT_WIDTH);
        let mut resizer = Resizer::new(target_width, REC_INPUT_HEIGHT)?;
        resizer.resize_image(crop, &mut self.resized_crop)?;

        let mut input = Array::zeros((1, 3, REC_INPUT_HEIGHT, target_width));
        for (index, chunk) in self.resized_crop.pixels.chunks_exact(3).enumerate() {
            let y = index / target_width;
            let x = index % target_width;
            input[[0, 0, y, x]] = chunk[0] as f32 / 255.0;
            input[[0, 1, y, x]] = chunk[1] as f32 / 255.0;
            input[[0, 2, y, x]] = chunk[2] as f32 / 255.0;
        }

        let inference_start_time = Instant::now();
        let outputs: SessionOutputs = self.session.run(inputs!["x" => input.view()]?)?;
        debug!("Recognition inference time: {:?}", inference_start_time.elapsed());

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| anyhow!("Recognition model returned no outputs"))?;
        let output = output.try_extract_tensor::<f32>()?;
        let steps = output.index_axis(Axis(0), 0);

        // Greedy CTC decode: argmax per timestep, drop blanks, collapse
        // repeated indices.
        let mut text = String::new();
        let mut scores = Vec::new();
        let mut previous_index = 0usize;
        for step in steps.outer_iter() {
            let (index, score) = step
                .iter()
                .copied()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.total_cmp(b))
                .ok_or_else(|| anyhow!("Recognition model produced an empty timestep"))?;
            if index != 0 && index != previous_index {
                let character = self.charset.get(index - 1).copied().ok_or_else(|| {
                    anyhow!(
                        "Class index {} outside the {}-character set",
                        index,
                        self.charset.len()
                    )
                })?;
                text.push(character);
                scores.push(score);
            }
            previous_index = index;
        }

        if text.is_empty() {
            return Ok(Vec::new());
        }

        let confidence =
            (scores.iter().sum::<f32>() / scores.len() as f32).clamp(0.0, 1.0);
        Ok(vec![Candidate { text, confidence }])
    }
}

/// Loads the per-line character dictionary shipped next to the weights, or
/// falls back to the built-in plate character set.
fn load_charset(model: &Path) -> anyhow::Result<Vec<char>> {
    let dictionary = model.with_extension("txt");
    if dictionary.exists() {
        let content = std::fs::read_to_string(&dictionary)?;
        let charset: Vec<char> = content
            .lines()
            .filter_map(|line| line.chars().next())
            .collect();
        if charset.is_empty() {
            bail!("Character dictionary {} is empty", dictionary.display());
        }
        info!(
            "Loaded {} characters from {:?}",
            charset.len(),
            dictionary
        );
        Ok(charset)
    } else {
        Ok(PLATE_CHARSET.chars().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(text: &str, confidence: f32) -> Candidate {
        Candidate {
            text: text.to_string(),
            confidence,
        }
    }

    #[test]
    fn test_select_rejects_empty_candidate_list() {
        assert_eq!(
            select_candidates(Vec::new(), CONFIDENCE_THRESHOLD),
            Err(RecognitionFailure::NoCandidates)
        );
    }

    #[test]
    fn test_select_rejects_candidates_below_threshold() {
        let candidates = vec![candidate("AB123", 0.2), candidate("CD456", 0.30)];
        assert_eq!(
            select_candidates(candidates, CONFIDENCE_THRESHOLD),
            Err(RecognitionFailure::BelowThreshold)
        );
    }

    #[test]
    fn test_select_joins_survivors_by_descending_confidence() {
        let candidates = vec![
            candidate("XY789", 0.5),
            candidate(" AB123 ", 0.9),
            candidate("ZZ000", 0.1),
        ];
        assert_eq!(
            select_candidates(candidates, CONFIDENCE_THRESHOLD),
            Ok("AB123 XY789".to_string())
        );
    }

    #[test]
    fn test_select_skips_blank_texts() {
        let candidates = vec![candidate("  ", 0.9), candidate("AB123", 0.8)];
        assert_eq!(
            select_candidates(candidates, CONFIDENCE_THRESHOLD),
            Ok("AB123".to_string())
        );
    }

    #[test]
    fn test_sentinel_strings_are_distinct() {
        let sentinels = [
            RecognitionFailure::NotAvailable.sentinel(),
            RecognitionFailure::NoCandidates.sentinel(),
            RecognitionFailure::BelowThreshold.sentinel(),
            RecognitionFailure::Engine("session failed".to_string()).sentinel(),
        ];
        for (i, a) in sentinels.iter().enumerate() {
            assert!(!a.is_empty());
            for b in sentinels.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
        assert_eq!(sentinels[3], "Erreur OCR: session failed");
    }

    #[test]
    fn test_engine_unavailable_when_weights_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = RecognitionEngine::load(dir.path().join("missing_rec.onnx"));
        assert!(!engine.is_available());

        let mut crop = Image {
            width: 2,
            height: 2,
            pixels: vec![0; 12],
        };
        assert_eq!(
            engine.read_plate(&mut crop),
            Err(RecognitionFailure::NotAvailable)
        );
    }

    #[test]
    fn test_load_charset_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let charset = load_charset(&dir.path().join("rec.onnx")).unwrap();
        assert_eq!(charset.len(), PLATE_CHARSET.chars().count());
        assert_eq!(charset[0], '0');
        assert_eq!(*charset.last().unwrap(), 'Z');
    }

    #[test]
    fn test_load_charset_prefers_dictionary_file() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("rec.onnx");
        std::fs::write(dir.path().join("rec.txt"), "A\nB\nC\n").unwrap();
        let charset = load_charset(&model).unwrap();
        assert_eq!(charset, vec!['A', 'B', 'C']);
    }

    #[test]
    fn test_load_charset_rejects_empty_dictionary() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("rec.onnx");
        std::fs::write(dir.path().join("rec.txt"), "").unwrap();
        assert!(load_charset(&model).is_err());
    }
}
