//! In-memory predictor double shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use crate::predictor::{PredictError, PredictResponse, Predictor};
use crate::types::UploadedImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Health {
    Up,
    Down,
    Hang,
}

#[derive(Debug)]
pub(crate) struct MockPredictor {
    health: Mutex<Health>,
    health_calls: AtomicUsize,
    predict_calls: AtomicUsize,
    responses: Mutex<VecDeque<Result<PredictResponse, PredictError>>>,
    hold_predictions: AtomicBool,
    released: Semaphore,
    uploads: Mutex<Vec<UploadedImage>>,
}

impl MockPredictor {
    pub(crate) fn new(health: Health) -> Arc<Self> {
        Arc::new(Self {
            health: Mutex::new(health),
            health_calls: AtomicUsize::new(0),
            predict_calls: AtomicUsize::new(0),
            responses: Mutex::new(VecDeque::new()),
            hold_predictions: AtomicBool::new(false),
            released: Semaphore::new(0),
            uploads: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_health(&self, health: Health) {
        *self.health.lock().unwrap() = health;
    }

    pub(crate) fn push_response(&self, response: Result<PredictResponse, PredictError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub(crate) fn respond_with(&self, prediction: &str, confidence: f64) {
        self.push_response(Ok(PredictResponse {
            prediction: prediction.to_string(),
            confidence,
            threshold: Some(0.5),
        }));
    }

    /// Keeps `predict` calls pending until [`MockPredictor::release_one`].
    pub(crate) fn hold_predictions(&self) {
        self.hold_predictions.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release_one(&self) {
        self.released.add_permits(1);
    }

    pub(crate) fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn predict_calls(&self) -> usize {
        self.predict_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn uploads(&self) -> Vec<UploadedImage> {
        self.uploads.lock().unwrap().clone()
    }
}

impl Predictor for MockPredictor {
    async fn check_health(&self) -> Result<(), PredictError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        let health = *self.health.lock().unwrap();
        match health {
            Health::Up => Ok(()),
            Health::Down => Err(PredictError::Status {
                status: 503,
                detail: None,
            }),
            Health::Hang => std::future::pending().await,
        }
    }

    async fn predict(&self, image: UploadedImage) -> Result<PredictResponse, PredictError> {
        self.predict_calls.fetch_add(1, Ordering::SeqCst);
        self.uploads.lock().unwrap().push(image);

        if self.hold_predictions.load(Ordering::SeqCst) {
            if let Ok(permit) = self.released.acquire().await {
                permit.forget();
            }
        }

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PredictError::Transport("no scripted response".to_string())))
    }
}
