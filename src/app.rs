use crate::canvas::{CANVAS_SIZE, StrokeCanvas};
use crate::ops::ai::DigitModel;
use crate::ops::predict::{PredictionMessage, PredictionScheduler};
use eframe::egui;
use std::sync::Arc;
use std::sync::mpsc;

/// Label text while nothing has been predicted.
pub const IDLE_LABEL: &str = "Draw a digit";
/// Native window title.
pub const WINDOW_TITLE: &str = "Handwritten Digit Recognizer";

const LABEL_SIZE: f32 = 16.0;

/// One drawing session: canvas, prediction slot and the label shown to the user.
///
/// All methods run on the UI thread. Results from the worker only reach the
/// label through [`DigitApp::poll_predictions`].
pub struct DigitApp {
    canvas: StrokeCanvas,
    scheduler: PredictionScheduler,
    prediction_receiver: mpsc::Receiver<PredictionMessage>,
    label: String,
    /// Bumped on every clear; results from older epochs are discarded.
    epoch: u64,
}

impl DigitApp {
    pub fn new(model: Arc<dyn DigitModel>) -> Self {
        let (scheduler, prediction_receiver) = PredictionScheduler::new(model);
        Self {
            canvas: StrokeCanvas::new(),
            scheduler,
            prediction_receiver,
            label: IDLE_LABEL.to_string(),
            epoch: 0,
        }
    }

    /// Build the app inside eframe; the worker wakes this context when done.
    pub fn with_context(cc: &eframe::CreationContext<'_>, model: Arc<dyn DigitModel>) -> Self {
        let mut app = Self::new(model);
        app.scheduler.set_repaint_context(cc.egui_ctx.clone());
        app
    }

    pub fn start_stroke(&mut self, x: f32, y: f32) {
        self.canvas.start_stroke(x, y);
    }

    /// Extend the current stroke and ask for a fresh prediction.
    /// Returns `false` for stray drags outside a stroke.
    pub fn extend_stroke(&mut self, x: f32, y: f32) -> bool {
        if self.canvas.extend_stroke(x, y).is_none() {
            return false;
        }
        self.request_prediction();
        true
    }

    pub fn end_stroke(&mut self) {
        self.canvas.end_stroke();
    }

    /// Clear the drawing and go back to the idle label.
    pub fn reset(&mut self) {
        self.canvas.clear();
        self.label = IDLE_LABEL.to_string();
        self.epoch = self.epoch.wrapping_add(1);
        log_info!("Canvas cleared (epoch {})", self.epoch);
    }

    /// Launch a prediction over a snapshot of the current buffer, unless one
    /// is already running.
    pub fn request_prediction(&mut self) -> bool {
        self.scheduler
            .request_prediction(self.canvas.snapshot(), self.epoch)
    }

    /// Apply every finished prediction to the label. Returns how many
    /// results were applied (stale ones are not counted).
    ///
    /// When only stale results arrive, ink drawn since the clear is
    /// re-requested: its own requests were dropped while the old task ran.
    pub fn poll_predictions(&mut self) -> usize {
        let mut applied = 0;
        let mut dropped_stale = false;
        while let Ok(msg) = self.prediction_receiver.try_recv() {
            if msg.epoch != self.epoch {
                log_info!("Dropping stale prediction from epoch {}", msg.epoch);
                dropped_stale = true;
                continue;
            }
            match &msg.outcome {
                Ok(p) => log_info!("Predicted {} ({:.3})", p.digit, p.confidence),
                Err(e) => log_err!("Prediction failed: {}", e),
            }
            self.label = msg.label();
            applied += 1;
        }
        if dropped_stale && applied == 0 && !self.canvas.segments().is_empty() {
            self.request_prediction();
        }
        applied
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn canvas(&self) -> &StrokeCanvas {
        &self.canvas
    }

    pub fn scheduler(&self) -> &PredictionScheduler {
        &self.scheduler
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The drawing surface: turns drag events into strokes and paints them.
    fn draw_canvas(&mut self, ui: &mut egui::Ui) {
        let side = CANVAS_SIZE as f32;
        let (response, painter) = ui.allocate_painter(egui::vec2(side, side), egui::Sense::drag());
        let origin = response.rect.min;

        if let Some(pos) = response.interact_pointer_pos() {
            let local = pos - origin;
            if response.drag_started() {
                self.start_stroke(local.x, local.y);
            } else if response.dragged() && response.drag_delta() != egui::Vec2::ZERO {
                self.extend_stroke(local.x, local.y);
            }
        }
        if response.drag_released() {
            self.end_stroke();
        }

        self.canvas.paint(&painter, response.rect);
    }
}

impl eframe::App for DigitApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // --- Poll async prediction results ---
        self.poll_predictions();

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| {
                self.draw_canvas(ui);
                ui.add_space(6.0);
                ui.label(egui::RichText::new(self.label.as_str()).size(LABEL_SIZE));
                ui.add_space(4.0);
                if ui.button("Clear").clicked() {
                    self.reset();
                }
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::PAPER;
    use crate::ops::ai::ModelError;
    use crate::ops::preprocess::ModelInput;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Returns 2 with 0.6 confidence once the gate is opened.
    struct Gated {
        gate: Mutex<mpsc::Receiver<()>>,
        calls: AtomicUsize,
    }

    impl DigitModel for Gated {
        fn predict(&self, _input: &ModelInput) -> Result<Vec<f32>, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.gate.lock().unwrap().recv();
            let mut scores = vec![0.04; 10];
            scores[2] = 0.64;
            Ok(scores)
        }
    }

    fn gated_app() -> (DigitApp, Arc<Gated>, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let model = Arc::new(Gated {
            gate: Mutex::new(rx),
            calls: AtomicUsize::new(0),
        });
        (DigitApp::new(model.clone()), model, tx)
    }

    /// Poll until a result lands or give up after a few seconds.
    fn wait_for_result(app: &mut DigitApp) -> usize {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let n = app.poll_predictions();
            if n > 0 || Instant::now() > deadline {
                return n;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn wait_idle(app: &DigitApp) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while app.scheduler().is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn starts_with_idle_label() {
        let (app, _, _) = gated_app();
        assert_eq!(app.label(), IDLE_LABEL);
        assert_eq!(app.epoch(), 0);
    }

    #[test]
    fn stray_drag_requests_nothing() {
        let (mut app, model, _) = gated_app();
        assert!(!app.extend_stroke(10.0, 10.0));
        assert_eq!(app.scheduler().launched(), 0);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drag_while_busy_draws_but_launches_once() {
        let (mut app, _model, open) = gated_app();
        app.start_stroke(20.0, 20.0);
        for i in 1..=6 {
            assert!(app.extend_stroke(20.0 + i as f32 * 30.0, 20.0 + i as f32 * 30.0));
        }
        assert_eq!(app.canvas().segments().len(), 6);
        assert_eq!(app.scheduler().launched(), 1);

        open.send(()).unwrap();
        assert_eq!(wait_for_result(&mut app), 1);
        assert_eq!(app.label(), "Prediction: 2 (0.64)");
    }

    #[test]
    fn clear_discards_in_flight_result() {
        let (mut app, _model, open) = gated_app();
        app.start_stroke(50.0, 50.0);
        app.extend_stroke(200.0, 200.0);
        app.end_stroke();
        assert!(app.scheduler().is_running());

        app.reset();
        open.send(()).unwrap();
        wait_idle(&app);
        // Give the message a moment to land, then drain it.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(app.poll_predictions(), 0);
        assert_eq!(app.label(), IDLE_LABEL);
    }

    #[test]
    fn ink_drawn_after_clear_is_classified_once_old_task_lands() {
        let (mut app, _model, open) = gated_app();
        app.start_stroke(50.0, 50.0);
        app.extend_stroke(200.0, 200.0);
        app.end_stroke();
        app.reset();

        // The old task still holds the slot, so this request is dropped.
        app.start_stroke(140.0, 30.0);
        assert!(app.extend_stroke(140.0, 250.0));
        app.end_stroke();
        assert_eq!(app.scheduler().launched(), 1);

        open.send(()).unwrap();
        open.send(()).unwrap();
        assert_eq!(wait_for_result(&mut app), 1);
        assert_eq!(app.scheduler().launched(), 2);
        assert_eq!(app.label(), "Prediction: 2 (0.64)");
    }

    #[test]
    fn reset_is_idempotent_and_canvas_starts_fresh() {
        let (mut app, _model, open) = gated_app();
        app.start_stroke(30.0, 140.0);
        app.extend_stroke(250.0, 140.0);
        open.send(()).unwrap();
        wait_for_result(&mut app);
        app.end_stroke();

        app.reset();
        app.reset();
        assert_eq!(app.label(), IDLE_LABEL);
        assert!(app.canvas().buffer().pixels().all(|p| p.0[0] == PAPER));
        assert!(app.canvas().segments().is_empty());

        app.start_stroke(140.0, 30.0);
        assert!(app.extend_stroke(140.0, 250.0));
        assert_eq!(app.canvas().segments().len(), 1);
        assert_eq!(app.canvas().segments()[0].from, (140.0, 30.0));
        open.send(()).unwrap();
        assert_eq!(wait_for_result(&mut app), 1);
        assert_eq!(app.label(), "Prediction: 2 (0.64)");
    }
}
