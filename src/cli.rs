use clap::Parser;
use std::path::PathBuf;

/// Error string written to stderr on a malformed invocation.
pub static USAGE_ERROR: &str = "Usage: plate_scan <image_path>";

#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"), about = "Detects license plates in an image and prints the result as a single JSON document on stdout")]
pub struct Cli {
    /// Path to the image to analyze
    pub image: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_single_image_argument() {
        let cli = Cli::try_parse_from(["plate_scan", "car.jpg"]).unwrap();
        assert_eq!(cli.image, PathBuf::from("car.jpg"));
    }

    #[test]
    fn test_rejects_missing_argument() {
        assert!(Cli::try_parse_from(["plate_scan"]).is_err());
    }

    #[test]
    fn test_rejects_extra_arguments() {
        assert!(Cli::try_parse_from(["plate_scan", "a.jpg", "b.jpg"]).is_err());
    }
}
