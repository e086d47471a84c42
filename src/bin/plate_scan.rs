use clap::Parser;
use plate_scan::{
    LogLevel, REC_MODEL_FILE_NAME,
    cli::{Cli, USAGE_ERROR},
    init_logging,
    ocr::RecognitionEngine,
    pipeline,
};
use std::{io::Write, path::PathBuf};

fn main() -> anyhow::Result<()> {
    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(_) => {
            // Malformed invocation is the only path that exits non-zero.
            let usage = serde_json::json!({ "success": false, "error": USAGE_ERROR });
            eprintln!("{usage}");
            std::process::exit(1);
        }
    };

    init_logging(LogLevel::Info)?;

    // The recognition engine is constructed once per process and reused for
    // every crop; a missing model degrades to sentinel text, not a failure.
    let mut engine = RecognitionEngine::load(PathBuf::from(REC_MODEL_FILE_NAME));

    let response = pipeline::run(&args.image, None, &mut engine);

    // Stdout carries exactly one JSON document, nothing else, no trailing
    // newline. Logical failures are reported in the body with exit code 0.
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &response)?;
    stdout.flush()?;
    Ok(())
}
