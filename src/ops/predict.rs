// ============================================================================
// PREDICTION SCHEDULER — single-slot background inference
// ============================================================================
//
// At most one worker runs at a time. Requests that arrive while it is busy
// are dropped, never queued. The worker owns a snapshot of the stroke buffer
// and reports back through an mpsc channel that the UI drains every frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;

use eframe::egui;
use image::GrayImage;

use super::ai::{DigitModel, ModelError};
use super::preprocess::to_model_input;

/// Number of classes the classifier scores.
pub const CLASS_COUNT: usize = 10;
/// Float noise allowed around [0, 1] before a score counts as a logit.
const SCORE_SLACK: f32 = 1e-4;

/// The model's verdict for one buffer snapshot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Prediction {
    pub digit: u8,
    pub confidence: f32,
}

impl Prediction {
    /// Pick the highest-scoring class. Ties go to the lower digit.
    pub fn from_scores(scores: &[f32]) -> Result<Self, PredictError> {
        if scores.len() != CLASS_COUNT {
            return Err(PredictError::Model(ModelError::InvalidOutput(format!(
                "expected {} class scores, got {}",
                CLASS_COUNT,
                scores.len()
            ))));
        }
        if scores.iter().any(|s| s.is_nan()) {
            return Err(PredictError::Model(ModelError::InvalidOutput(
                "scores contain NaN".to_string(),
            )));
        }
        if let Some(out) = scores
            .iter()
            .find(|&&s| !(-SCORE_SLACK..=1.0 + SCORE_SLACK).contains(&s))
        {
            return Err(PredictError::Model(ModelError::InvalidOutput(format!(
                "score {} is not a probability",
                out
            ))));
        }

        let mut best = 0;
        for (i, &score) in scores.iter().enumerate().skip(1) {
            if score > scores[best] {
                best = i;
            }
        }
        Ok(Self {
            digit: best as u8,
            confidence: scores[best],
        })
    }

    pub fn label(&self) -> String {
        format!("Prediction: {} ({:.2})", self.digit, self.confidence)
    }
}

/// Everything that can go wrong inside one prediction task.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictError {
    /// The snapshot had no pixels to resample.
    EmptyBuffer,
    Model(ModelError),
    /// The model panicked; the payload text is kept for the label.
    WorkerPanicked(String),
    /// The OS refused to start the worker thread.
    SpawnFailed(String),
}

impl std::fmt::Display for PredictError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PredictError::EmptyBuffer => write!(f, "stroke buffer is empty"),
            PredictError::Model(e) => write!(f, "{}", e),
            PredictError::WorkerPanicked(msg) => write!(f, "prediction panicked: {}", msg),
            PredictError::SpawnFailed(e) => write!(f, "could not start prediction worker: {}", e),
        }
    }
}

impl std::error::Error for PredictError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PredictError::Model(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ModelError> for PredictError {
    fn from(e: ModelError) -> Self {
        PredictError::Model(e)
    }
}

/// Resize, normalize and classify one buffer snapshot.
pub fn run_prediction(model: &dyn DigitModel, buffer: &GrayImage) -> Result<Prediction, PredictError> {
    let input = to_model_input(buffer).ok_or(PredictError::EmptyBuffer)?;
    let scores = model.predict(&input)?;
    Prediction::from_scores(&scores)
}

/// Text shown in the label for a finished task.
pub fn outcome_label(outcome: &Result<Prediction, PredictError>) -> String {
    match outcome {
        Ok(prediction) => prediction.label(),
        Err(e) => format!("Error: {}", e),
    }
}

/// Result delivered from the prediction worker to the UI thread.
#[derive(Debug)]
pub struct PredictionMessage {
    /// Canvas epoch the request was made in; stale after a clear.
    pub epoch: u64,
    pub outcome: Result<Prediction, PredictError>,
}

impl PredictionMessage {
    pub fn label(&self) -> String {
        outcome_label(&self.outcome)
    }
}

/// Single-slot launcher for background predictions.
pub struct PredictionScheduler {
    model: Arc<dyn DigitModel>,
    busy: Arc<AtomicBool>,
    launched: Arc<AtomicU64>,
    sender: mpsc::Sender<PredictionMessage>,
    repaint: Option<egui::Context>,
}

impl PredictionScheduler {
    /// Create a scheduler and the receiver its results arrive on.
    pub fn new(model: Arc<dyn DigitModel>) -> (Self, mpsc::Receiver<PredictionMessage>) {
        let (sender, receiver) = mpsc::channel();
        let scheduler = Self {
            model,
            busy: Arc::new(AtomicBool::new(false)),
            launched: Arc::new(AtomicU64::new(0)),
            sender,
            repaint: None,
        };
        (scheduler, receiver)
    }

    /// Wake this egui context after each result so the UI picks it up
    /// without waiting for more input.
    pub fn set_repaint_context(&mut self, ctx: egui::Context) {
        self.repaint = Some(ctx);
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Total tasks ever launched.
    pub fn launched(&self) -> u64 {
        self.launched.load(Ordering::Acquire)
    }

    /// Launch a prediction over `snapshot` unless one is already running.
    ///
    /// Returns `true` if a task was launched, `false` if the request was
    /// dropped because the slot is busy.
    pub fn request_prediction(&self, snapshot: GrayImage, epoch: u64) -> bool {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let model = Arc::clone(&self.model);
        let busy = Arc::clone(&self.busy);
        let sender = self.sender.clone();
        let repaint = self.repaint.clone();

        let spawned = std::thread::Builder::new()
            .name("digit-predict".to_string())
            .spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    run_prediction(&*model, &snapshot)
                }))
                .unwrap_or_else(|payload| Err(PredictError::WorkerPanicked(panic_text(&*payload))));

                // Idle before the result is visible, so whoever reads the
                // message can immediately launch the next task.
                busy.store(false, Ordering::Release);
                let _ = sender.send(PredictionMessage { epoch, outcome });
                if let Some(ctx) = repaint {
                    ctx.request_repaint();
                }
            });

        match spawned {
            Ok(_) => {
                self.launched.fetch_add(1, Ordering::AcqRel);
                log_info!("Prediction launched (epoch {})", epoch);
                true
            }
            Err(e) => {
                self.busy.store(false, Ordering::Release);
                log_err!("Could not spawn prediction worker: {}", e);
                let _ = self.sender.send(PredictionMessage {
                    epoch,
                    outcome: Err(PredictError::SpawnFailed(e.to_string())),
                });
                false
            }
        }
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::blank_buffer;
    use crate::ops::preprocess::ModelInput;
    use approx::assert_abs_diff_eq;
    use std::sync::Mutex;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn one_hot(digit: usize, confidence: f32) -> Vec<f32> {
        let rest = (1.0 - confidence) / 9.0;
        (0..CLASS_COUNT)
            .map(|i| if i == digit { confidence } else { rest })
            .collect()
    }

    struct Fixed(Vec<f32>);

    impl DigitModel for Fixed {
        fn predict(&self, _input: &ModelInput) -> Result<Vec<f32>, ModelError> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl DigitModel for Failing {
        fn predict(&self, _input: &ModelInput) -> Result<Vec<f32>, ModelError> {
            Err(ModelError::InferenceFailed("boom".to_string()))
        }
    }

    struct Panicking;

    impl DigitModel for Panicking {
        fn predict(&self, _input: &ModelInput) -> Result<Vec<f32>, ModelError> {
            panic!("model exploded");
        }
    }

    /// Blocks in `predict` until the test opens the gate.
    struct Gated {
        gate: Mutex<mpsc::Receiver<()>>,
        entered: Mutex<mpsc::Sender<()>>,
        calls: AtomicU64,
    }

    impl DigitModel for Gated {
        fn predict(&self, _input: &ModelInput) -> Result<Vec<f32>, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.gate.lock().unwrap().recv();
            Ok(one_hot(7, 0.9))
        }
    }

    fn gated() -> (Arc<Gated>, mpsc::Sender<()>, mpsc::Receiver<()>) {
        let (open_tx, open_rx) = mpsc::channel();
        let (entered_tx, entered_rx) = mpsc::channel();
        let model = Arc::new(Gated {
            gate: Mutex::new(open_rx),
            entered: Mutex::new(entered_tx),
            calls: AtomicU64::new(0),
        });
        (model, open_tx, entered_rx)
    }

    #[test]
    fn argmax_picks_highest_score() {
        let p = Prediction::from_scores(&one_hot(3, 0.8)).unwrap();
        assert_eq!(p.digit, 3);
        assert_abs_diff_eq!(p.confidence, 0.8);
        assert_eq!(p.label(), "Prediction: 3 (0.80)");
    }

    #[test]
    fn argmax_ties_go_to_lower_digit() {
        let p = Prediction::from_scores(&[0.1; CLASS_COUNT]).unwrap();
        assert_eq!(p.digit, 0);
    }

    #[test]
    fn wrong_score_count_is_an_error() {
        let err = Prediction::from_scores(&[0.5, 0.5]).unwrap_err();
        assert!(matches!(err, PredictError::Model(ModelError::InvalidOutput(_))));
        assert!(Prediction::from_scores(&[f32::NAN; CLASS_COUNT]).is_err());
    }

    #[test]
    fn logits_are_rejected() {
        let mut logits = vec![-3.1; CLASS_COUNT];
        logits[7] = 7.52;
        let err = Prediction::from_scores(&logits).unwrap_err();
        assert!(matches!(err, PredictError::Model(ModelError::InvalidOutput(_))));
        assert!(outcome_label(&Err(err)).starts_with("Error: Invalid model output:"));
        // Softmax rounding just past 1.0 is still a probability.
        assert_eq!(Prediction::from_scores(&one_hot(5, 1.000_01)).unwrap().digit, 5);
    }

    #[test]
    fn label_rounds_to_two_decimals() {
        let p = Prediction {
            digit: 9,
            confidence: 0.996,
        };
        assert_eq!(p.label(), "Prediction: 9 (1.00)");
    }

    #[test]
    fn run_prediction_reports_empty_buffer() {
        let err = run_prediction(&Fixed(one_hot(1, 1.0)), &GrayImage::new(0, 0)).unwrap_err();
        assert_eq!(err, PredictError::EmptyBuffer);
        assert_eq!(
            outcome_label(&Err(err)),
            "Error: stroke buffer is empty"
        );
    }

    #[test]
    fn successful_task_reports_and_returns_to_idle() {
        let (scheduler, rx) = PredictionScheduler::new(Arc::new(Fixed(one_hot(4, 0.75))));
        assert!(scheduler.request_prediction(blank_buffer(), 0));
        let msg = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(msg.label(), "Prediction: 4 (0.75)");
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.launched(), 1);
    }

    #[test]
    fn requests_while_running_are_dropped_not_queued() {
        let (model, open, entered) = gated();
        let (scheduler, rx) = PredictionScheduler::new(model.clone());

        assert!(scheduler.request_prediction(blank_buffer(), 0));
        entered.recv_timeout(WAIT).unwrap();
        assert!(scheduler.is_running());

        for _ in 0..5 {
            assert!(!scheduler.request_prediction(blank_buffer(), 0));
        }
        assert_eq!(scheduler.launched(), 1);

        open.send(()).unwrap();
        let msg = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(msg.label(), "Prediction: 7 (0.90)");
        assert!(!scheduler.is_running());

        // Nothing deferred shows up later.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.launched(), 1);
    }

    #[test]
    fn slot_reopens_after_completion() {
        let (model, open, entered) = gated();
        let (scheduler, rx) = PredictionScheduler::new(model.clone());

        assert!(scheduler.request_prediction(blank_buffer(), 0));
        entered.recv_timeout(WAIT).unwrap();
        open.send(()).unwrap();
        rx.recv_timeout(WAIT).unwrap();

        assert!(scheduler.request_prediction(blank_buffer(), 1));
        entered.recv_timeout(WAIT).unwrap();
        open.send(()).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().epoch, 1);
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn model_error_surfaces_as_label() {
        let (scheduler, rx) = PredictionScheduler::new(Arc::new(Failing));
        assert!(scheduler.request_prediction(blank_buffer(), 0));
        let msg = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(msg.label(), "Error: Inference failed: boom");
        assert!(!scheduler.is_running());
    }

    #[test]
    fn model_panic_is_contained() {
        let (scheduler, rx) = PredictionScheduler::new(Arc::new(Panicking));
        assert!(scheduler.request_prediction(blank_buffer(), 0));
        let msg = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(msg.label(), "Error: prediction panicked: model exploded");
        assert!(!scheduler.is_running());
        // Still usable afterwards.
        assert!(scheduler.request_prediction(blank_buffer(), 0));
        rx.recv_timeout(WAIT).unwrap();
    }
}
