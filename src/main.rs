use std::sync::Arc;

use clap::Parser;
use digitpad::app::{DigitApp, WINDOW_TITLE};
use digitpad::cli::{self, CliArgs};
use digitpad::{logger, log_err, log_info};
use eframe::egui;

fn main() -> Result<(), eframe::Error> {
    let args = CliArgs::parse();

    // -- Headless mode ---------------------------------------------------
    if args.image.is_some() {
        let code = cli::run(&args);
        std::process::exit(if code == std::process::ExitCode::SUCCESS {
            0
        } else {
            1
        });
    }

    // -- GUI mode --------------------------------------------------------
    logger::init();
    log_info!(
        "Model: {}  Runtime: {}  Threads: {}",
        args.model_path().display(),
        args.runtime_path().display(),
        args.threads
    );

    // The model is loaded before any window exists; without it there is
    // nothing to show.
    let model = match args.load_model() {
        Ok(model) => model,
        Err(e) => {
            log_err!("Startup failed: {}", e);
            eprintln!("error: {}", e);
            if let Some(path) = logger::log_path() {
                eprintln!("session log: {}", path.display());
            }
            std::process::exit(1);
        }
    };
    log_info!("Model ready on ONNX Runtime {}", model.runtime_version());
    let model = Arc::new(model);

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([320.0, 380.0])
            .with_resizable(false)
            .with_title(WINDOW_TITLE),
        ..Default::default()
    };

    eframe::run_native(
        WINDOW_TITLE,
        options,
        Box::new(move |cc| Box::new(DigitApp::with_context(cc, model))),
    )
}
