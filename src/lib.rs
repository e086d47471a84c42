use clap::ValueEnum;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{Level, info};

pub mod api;
pub mod cli;
pub mod detector;
pub mod image;
pub mod ocr;
pub mod pipeline;

/// Default object detection weights, resolved relative to the working directory.
pub static DEFAULT_MODEL_FILE_NAME: &str = "best.onnx";
/// Default text recognition weights for the plate reader.
pub static REC_MODEL_FILE_NAME: &str = "paddle_ocr_rec.onnx";
/// Class list used when no YAML file is provided. Plate detection models
/// are trained on a single class.
pub static PLATE_CLASSES_STR: &str = "NAMES:\n  - license_plate\n";

#[allow(non_snake_case)]
#[derive(Debug, Deserialize)]
struct ObjectClasses {
    NAMES: Vec<String>,
}

pub fn get_object_classes(yaml_file: Option<PathBuf>) -> anyhow::Result<Vec<String>> {
    let yaml_data = match yaml_file {
        Some(yaml_file) => std::fs::read_to_string(yaml_file)?,
        None => PLATE_CLASSES_STR.to_string(),
    };
    Ok(serde_yaml::from_str::<ObjectClasses>(yaml_data.as_str())?.NAMES)
}

/// Initializes tracing with all output on stderr. Stdout carries exactly one
/// JSON document per invocation, so nothing else may write to it.
pub fn init_logging(log_level: LogLevel) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(log_level)));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|_| anyhow::anyhow!("Logging already initialized"))?;

    info!(?log_level, "Logging initialized");
    Ok(())
}

fn level_to_filter_string(log_level: LogLevel) -> String {
    let level = match log_level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };
    // The onnxruntime session is chatty at info level
    format!("{level},ort=warn")
}

#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    ValueEnum,
    Debug,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}
