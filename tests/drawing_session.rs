use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use digitpad::canvas::{CANVAS_SIZE, PAPER};
use digitpad::ops::preprocess::INPUT_SHAPE;
use digitpad::{DigitApp, DigitModel, ModelError, ModelInput};

/// Records every tensor it sees and answers with a fixed digit.
struct Recording {
    seen: Mutex<Vec<ModelInput>>,
    digit: usize,
}

impl DigitModel for Recording {
    fn predict(&self, input: &ModelInput) -> Result<Vec<f32>, ModelError> {
        self.seen.lock().unwrap().push(input.clone());
        let mut scores = vec![0.01; 10];
        scores[self.digit] = 0.91;
        Ok(scores)
    }
}

struct Broken;

impl DigitModel for Broken {
    fn predict(&self, _input: &ModelInput) -> Result<Vec<f32>, ModelError> {
        Err(ModelError::InferenceFailed("session crashed".to_string()))
    }
}

fn settle(app: &mut DigitApp) -> usize {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let n = app.poll_predictions();
        if n > 0 || Instant::now() > deadline {
            return n;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn matches_label_pattern(label: &str) -> bool {
    let Some(rest) = label.strip_prefix("Prediction: ") else {
        return false;
    };
    let mut parts = rest.splitn(2, ' ');
    let digit_ok = parts
        .next()
        .is_some_and(|d| d.len() == 1 && d.chars().all(|c| c.is_ascii_digit()));
    let conf_ok = parts.next().is_some_and(|c| {
        c.strip_prefix('(')
            .and_then(|c| c.strip_suffix(')'))
            .and_then(|c| {
                let (_, frac) = c.split_once('.')?;
                if frac.len() != 2 {
                    return None;
                }
                c.parse::<f32>().ok()
            })
            .is_some_and(|v| (0.0..=1.0).contains(&v))
    });
    digit_ok && conf_ok
}

#[test]
fn diagonal_stroke_yields_prediction_label() {
    let model = Arc::new(Recording {
        seen: Mutex::new(Vec::new()),
        digit: 7,
    });
    let mut app = DigitApp::new(model.clone());

    let end = CANVAS_SIZE as f32 - 20.0;
    app.start_stroke(20.0, 20.0);
    assert!(app.extend_stroke(end, end));
    app.end_stroke();

    assert_eq!(settle(&mut app), 1);
    assert_eq!(app.label(), "Prediction: 7 (0.91)");
    assert!(matches_label_pattern(app.label()));

    let seen = model.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let tensor = &seen[0];
    assert_eq!(tensor.shape, INPUT_SHAPE);
    assert_eq!(tensor.data.len(), 28 * 28);
    assert!(tensor.data.iter().all(|v| (0.0..=1.0).contains(v)));
    // Ink on the diagonal, nothing in the opposite corners.
    assert!(tensor.at(14, 14) > 0.5);
    assert!(tensor.at(27, 0) < 0.05);
    assert!(tensor.at(0, 27) < 0.05);
}

#[test]
fn failing_model_shows_error_and_recovers() {
    let mut app = DigitApp::new(Arc::new(Broken));
    app.start_stroke(10.0, 10.0);
    app.extend_stroke(100.0, 100.0);

    assert_eq!(settle(&mut app), 1);
    assert_eq!(app.label(), "Error: Inference failed: session crashed");
    assert!(!app.scheduler().is_running());

    // The next segment triggers a fresh attempt.
    assert!(app.extend_stroke(150.0, 100.0));
    assert_eq!(app.scheduler().launched(), 2);
    assert_eq!(settle(&mut app), 1);
}

#[test]
fn clear_after_prediction_restores_idle_state() {
    let model = Arc::new(Recording {
        seen: Mutex::new(Vec::new()),
        digit: 3,
    });
    let mut app = DigitApp::new(model);
    app.start_stroke(60.0, 60.0);
    app.extend_stroke(220.0, 60.0);
    settle(&mut app);
    assert_eq!(app.label(), "Prediction: 3 (0.91)");

    app.reset();
    assert_eq!(app.label(), "Draw a digit");
    assert!(app.canvas().buffer().pixels().all(|p| p.0[0] == PAPER));
}

#[test]
fn label_pattern_helper() {
    assert!(matches_label_pattern("Prediction: 0 (0.00)"));
    assert!(matches_label_pattern("Prediction: 9 (1.00)"));
    assert!(!matches_label_pattern("Prediction: 10 (0.50)"));
    assert!(!matches_label_pattern("Prediction: 5 (0.5)"));
    assert!(!matches_label_pattern("Error: nope"));
}
