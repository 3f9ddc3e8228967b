// ============================================================================
// DigitPad CLI — model configuration + headless single-image prediction
// ============================================================================
//
// Usage examples:
//   DigitPad                                       (GUI, ./bestmodel.onnx)
//   DigitPad --model models/mnist.onnx --onnx-runtime /opt/ort/libonnxruntime.so
//   DigitPad --image seven.png                     (no GUI, prints the prediction)

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use crate::ops::ai::{DigitModel, ModelError, OnnxDigitModel};
use crate::ops::predict::{PredictError, Prediction, run_prediction};

/// Model file looked up in the working directory when `--model` is omitted.
pub const DEFAULT_MODEL: &str = "bestmodel.onnx";

#[cfg(target_os = "windows")]
pub const RUNTIME_LIB_NAME: &str = "onnxruntime.dll";
#[cfg(target_os = "macos")]
pub const RUNTIME_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const RUNTIME_LIB_NAME: &str = "libonnxruntime.so";

/// Handwritten digit recognizer.
///
/// Opens a drawing window by default; with --image it classifies one file
/// and exits without a GUI.
#[derive(Parser, Debug, Clone)]
#[command(name = "DigitPad", about = "Draw a digit and get a live prediction")]
pub struct CliArgs {
    /// ONNX classifier taking a [1, 28, 28, 1] float input and returning 10 scores.
    #[arg(short, long, default_value = DEFAULT_MODEL, value_name = "FILE.onnx")]
    pub model: PathBuf,

    /// ONNX Runtime shared library. Defaults to the platform library next to
    /// the executable, then in the working directory.
    #[arg(long, value_name = "FILE")]
    pub onnx_runtime: Option<PathBuf>,

    /// Classify this image (any size, converted to grayscale) and exit.
    #[arg(short, long, value_name = "IMAGE")]
    pub image: Option<PathBuf>,

    /// Intra-op thread count for ONNX Runtime.
    #[arg(short, long, default_value_t = 1)]
    pub threads: u16,
}

impl CliArgs {
    pub fn model_path(&self) -> PathBuf {
        absolutize(&self.model)
    }

    pub fn runtime_path(&self) -> PathBuf {
        match &self.onnx_runtime {
            Some(p) => absolutize(p),
            None => default_runtime_path(),
        }
    }

    /// Load the ONNX session. Failure here aborts startup.
    pub fn load_model(&self) -> Result<OnnxDigitModel, ModelError> {
        OnnxDigitModel::load(&self.runtime_path(), &self.model_path(), self.threads)
    }
}

/// Resolve against the working directory, following `..` when the file exists.
pub fn absolutize(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(dir) => dir.join(path),
        Err(_) => path.to_path_buf(),
    }
}

fn default_runtime_path() -> PathBuf {
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let beside_exe = dir.join(RUNTIME_LIB_NAME);
        if beside_exe.exists() {
            return beside_exe;
        }
    }
    absolutize(Path::new(RUNTIME_LIB_NAME))
}

/// Failure while classifying a file from the command line.
#[derive(Debug)]
pub enum CliError {
    Image(image::ImageError),
    Predict(PredictError),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Image(e) => write!(f, "could not read image: {}", e),
            CliError::Predict(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CliError {}

/// Load an image, reduce it to one luminance channel and classify it the same
/// way the canvas buffer is classified.
pub fn classify_file(model: &dyn DigitModel, path: &Path) -> Result<Prediction, CliError> {
    let gray = image::open(path).map_err(CliError::Image)?.into_luma8();
    run_prediction(model, &gray).map_err(CliError::Predict)
}

/// Headless mode: load the model, classify `--image`, print the label line.
/// `SUCCESS` on a prediction, `FAILURE` otherwise.
pub fn run(args: &CliArgs) -> ExitCode {
    let Some(image_path) = args.image.as_deref() else {
        eprintln!("error: --image is required in headless mode");
        return ExitCode::FAILURE;
    };

    let model = match args.load_model() {
        Ok(m) => m,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let start = Instant::now();
    match classify_file(&model, image_path) {
        Ok(prediction) => {
            println!("{}", prediction.label());
            log_info!(
                "Classified {} in {:.1?}",
                image_path.display(),
                start.elapsed()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
