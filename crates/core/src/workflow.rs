//! The detection workflow: one upload-to-result cycle at a time.
//!
//! All transitions go through [`DetectionWorkflow`]; the state it guards is
//! never exposed mutably. Every transition publishes a fresh
//! [`WorkflowSnapshot`] on a watch channel for presentation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::predictor::{PredictError, PredictResponse, Predictor};
use crate::types::{
    ConnectivityState, DetectionStatus, ImageId, ImageSummary, PredictionResult, UploadedImage,
};

pub const BACKEND_NOT_CONNECTED: &str = "backend not connected";

/// Read model published after every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSnapshot {
    pub status: DetectionStatus,
    pub image: Option<ImageSummary>,
    pub result: Option<PredictionResult>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSnapshot {
    pub fn confidence_percent(&self) -> Option<String> {
        self.result.as_ref().map(PredictionResult::confidence_percent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StartRejection {
    #[error("no image has been uploaded")]
    NoImage,
    #[error("an analysis is already in progress")]
    AlreadyAnalyzing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A predictor request is in flight for this image.
    Started(ImageId),
    /// The predictor was not connected; the workflow is now `AnalysisFailed`
    /// and nothing was sent.
    Blocked,
    /// Start is not valid in the current state; nothing changed.
    Rejected(StartRejection),
}

#[derive(Debug)]
struct WorkflowState {
    status: DetectionStatus,
    image: Option<UploadedImage>,
    result: Option<PredictionResult>,
    error: Option<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug)]
enum StartDecision {
    Dispatch(UploadedImage),
    Blocked,
    Rejected(StartRejection),
}

#[derive(Debug, PartialEq)]
enum Completion {
    Applied(DetectionStatus),
    Stale,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            status: DetectionStatus::NoImage,
            image: None,
            result: None,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

impl WorkflowState {
    fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            status: self.status,
            image: self.image.as_ref().map(UploadedImage::summary),
            result: self.result.clone(),
            error: self.error.clone(),
            updated_at: self.updated_at,
        }
    }

    fn enter(&mut self, status: DetectionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Returns the id of the image that was replaced, if any.
    fn acquire(&mut self, image: UploadedImage) -> Option<ImageId> {
        let replaced = self.image.replace(image).map(|previous| previous.id());
        self.result = None;
        self.error = None;
        self.enter(DetectionStatus::ImageReady);
        replaced
    }

    fn begin(&mut self, connectivity: ConnectivityState) -> StartDecision {
        if self.status == DetectionStatus::Analyzing {
            return StartDecision::Rejected(StartRejection::AlreadyAnalyzing);
        }
        let Some(image) = self.image.clone() else {
            return StartDecision::Rejected(StartRejection::NoImage);
        };

        self.result = None;
        if connectivity != ConnectivityState::Connected {
            self.error = Some(BACKEND_NOT_CONNECTED.to_string());
            self.enter(DetectionStatus::AnalysisFailed);
            return StartDecision::Blocked;
        }

        self.error = None;
        self.enter(DetectionStatus::Analyzing);
        StartDecision::Dispatch(image)
    }

    fn complete(
        &mut self,
        image_id: ImageId,
        outcome: Result<PredictResponse, PredictError>,
    ) -> Completion {
        let current = self.image.as_ref().map(UploadedImage::id);
        if self.status != DetectionStatus::Analyzing || current != Some(image_id) {
            return Completion::Stale;
        }

        match outcome.and_then(|response| response.into_result(image_id)) {
            Ok(result) => {
                let status = result.label.status();
                self.result = Some(result);
                self.error = None;
                self.enter(status);
            }
            Err(error) => {
                self.result = None;
                self.error = Some(error.to_string());
                self.enter(DetectionStatus::AnalysisFailed);
            }
        }
        Completion::Applied(self.status)
    }

    fn reset(&mut self) {
        self.image = None;
        self.result = None;
        self.error = None;
        self.enter(DetectionStatus::NoImage);
    }
}

/// Controller for the detection workflow. Clones share the same state.
pub struct DetectionWorkflow<P> {
    inner: Arc<Shared<P>>,
}

struct Shared<P> {
    predictor: Arc<P>,
    connectivity: watch::Receiver<ConnectivityState>,
    state: Mutex<WorkflowState>,
    snapshots: watch::Sender<WorkflowSnapshot>,
}

impl<P> Clone for DetectionWorkflow<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Predictor> DetectionWorkflow<P> {
    pub fn new(predictor: Arc<P>, connectivity: watch::Receiver<ConnectivityState>) -> Self {
        let state = WorkflowState::default();
        let (snapshots, _) = watch::channel(state.snapshot());
        Self {
            inner: Arc::new(Shared {
                predictor,
                connectivity,
                state: Mutex::new(state),
                snapshots,
            }),
        }
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    pub fn status(&self) -> DetectionStatus {
        self.inner.snapshots.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowSnapshot> {
        self.inner.snapshots.subscribe()
    }

    /// A new image replaces whatever was held; any in-flight analysis of the
    /// previous image becomes stale.
    pub fn image_acquired(&self, image: UploadedImage) -> WorkflowSnapshot {
        let image_id = image.id();
        let mut state = self.inner.lock_state();
        let previous_status = state.status;
        let replaced = state.acquire(image);
        info!(
            %image_id,
            replaced = ?replaced,
            from = ?previous_status,
            "Image ready for analysis"
        );
        self.inner.publish(&state)
    }

    /// Evaluates the connectivity guard and, when connected, sends exactly
    /// one predictor request in the background.
    pub fn start_analysis(&self) -> StartOutcome {
        let connectivity = *self.inner.connectivity.borrow();
        let mut state = self.inner.lock_state();

        let image = match state.begin(connectivity) {
            StartDecision::Dispatch(image) => image,
            StartDecision::Blocked => {
                warn!(%connectivity, "Analysis blocked: predictor not connected");
                self.inner.publish(&state);
                return StartOutcome::Blocked;
            }
            StartDecision::Rejected(reason) => {
                debug!(%reason, status = ?state.status, "Analysis start ignored");
                return StartOutcome::Rejected(reason);
            }
        };

        let image_id = image.id();
        info!(%image_id, bytes = image.len(), "Analysis started");
        self.inner.publish(&state);
        drop(state);

        let shared = self.inner.clone();
        tokio::spawn(async move {
            let outcome = shared.predictor.predict(image).await;
            shared.finish(image_id, outcome);
        });

        StartOutcome::Started(image_id)
    }

    pub fn reset(&self) -> WorkflowSnapshot {
        let mut state = self.inner.lock_state();
        let had_request = state.status == DetectionStatus::Analyzing;
        state.reset();
        info!(abandoned_request = had_request, "Workflow reset");
        self.inner.publish(&state)
    }

    /// Resolves with the first snapshot that is not `Analyzing`.
    pub async fn wait_until_settled(&self) -> WorkflowSnapshot {
        let mut rx = self.subscribe();
        let settled = rx
            .wait_for(|snapshot| snapshot.status != DetectionStatus::Analyzing)
            .await
            .map(|snapshot| snapshot.clone());
        settled.unwrap_or_else(|_| self.snapshot())
    }
}

impl<P> Shared<P> {
    fn lock_state(&self) -> MutexGuard<'_, WorkflowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &WorkflowState) -> WorkflowSnapshot {
        let snapshot = state.snapshot();
        self.snapshots.send_replace(snapshot.clone());
        snapshot
    }

    fn finish(&self, image_id: ImageId, outcome: Result<PredictResponse, PredictError>) {
        let failure = outcome.as_ref().err().map(ToString::to_string);
        let mut state = self.lock_state();

        match state.complete(image_id, outcome) {
            Completion::Stale => {
                debug!(%image_id, status = ?state.status, "Discarding stale prediction result");
            }
            Completion::Applied(status) => {
                match (&state.result, failure) {
                    (Some(result), _) => info!(
                        %image_id,
                        ?status,
                        label = result.label.as_str(),
                        confidence = result.confidence,
                        "Analysis finished"
                    ),
                    (None, Some(error)) => warn!(%image_id, %error, "Analysis failed"),
                    (None, None) => warn!(
                        %image_id,
                        error = state.error.as_deref().unwrap_or_default(),
                        "Analysis failed"
                    ),
                }
                self.publish(&state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{Health, MockPredictor};
    use crate::types::PredictionLabel;

    fn png(name: &str) -> UploadedImage {
        UploadedImage::new(name, "image/png", vec![0x89, b'P', b'N', b'G'])
    }

    fn ok_response(prediction: &str, confidence: f64) -> Result<PredictResponse, PredictError> {
        Ok(PredictResponse {
            prediction: prediction.to_string(),
            confidence,
            threshold: Some(0.5),
        })
    }

    fn workflow_with(
        connectivity: ConnectivityState,
    ) -> (
        DetectionWorkflow<MockPredictor>,
        Arc<MockPredictor>,
        watch::Sender<ConnectivityState>,
    ) {
        let predictor = MockPredictor::new(Health::Up);
        let (tx, rx) = watch::channel(connectivity);
        (DetectionWorkflow::new(predictor.clone(), rx), predictor, tx)
    }

    #[test]
    fn machine_starts_empty() {
        let state = WorkflowState::default();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.status, DetectionStatus::NoImage);
        assert!(snapshot.image.is_none());
        assert!(snapshot.result.is_none());
        assert!(snapshot.error.is_none());
    }

    #[test]
    fn machine_start_without_image_is_a_no_op() {
        let mut state = WorkflowState::default();
        let decision = state.begin(ConnectivityState::Connected);
        assert!(matches!(
            decision,
            StartDecision::Rejected(StartRejection::NoImage)
        ));
        assert_eq!(state.status, DetectionStatus::NoImage);
    }

    #[test]
    fn machine_acquire_clears_previous_outcome() {
        let mut state = WorkflowState::default();
        let first = png("first.png");
        let first_id = first.id();
        state.acquire(first);
        assert!(matches!(
            state.begin(ConnectivityState::Connected),
            StartDecision::Dispatch(_)
        ));
        state.complete(first_id, Err(PredictError::Transport("reset".to_string())));
        assert_eq!(state.status, DetectionStatus::AnalysisFailed);
        assert!(state.error.is_some());

        let replaced = state.acquire(png("second.png"));
        assert_eq!(replaced, Some(first_id));
        assert_eq!(state.status, DetectionStatus::ImageReady);
        assert!(state.error.is_none());
        assert!(state.result.is_none());
    }

    #[test]
    fn machine_guard_blocks_every_non_connected_state() {
        for connectivity in [ConnectivityState::Checking, ConnectivityState::Disconnected] {
            let mut state = WorkflowState::default();
            state.acquire(png("scan.png"));
            assert!(matches!(state.begin(connectivity), StartDecision::Blocked));
            assert_eq!(state.status, DetectionStatus::AnalysisFailed);
            assert_eq!(state.error.as_deref(), Some(BACKEND_NOT_CONNECTED));
            assert!(state.image.is_some(), "image is kept for a later retry");
        }
    }

    #[test]
    fn machine_refuses_second_start_while_analyzing() {
        let mut state = WorkflowState::default();
        state.acquire(png("scan.png"));
        assert!(matches!(
            state.begin(ConnectivityState::Connected),
            StartDecision::Dispatch(_)
        ));
        assert!(matches!(
            state.begin(ConnectivityState::Connected),
            StartDecision::Rejected(StartRejection::AlreadyAnalyzing)
        ));
        assert_eq!(state.status, DetectionStatus::Analyzing);
    }

    #[test]
    fn machine_maps_labels_to_statuses() {
        let cases = [
            ("Tumor Detected", DetectionStatus::TumorDetected),
            ("No Tumor Detected", DetectionStatus::NoTumorDetected),
            ("Inconclusive", DetectionStatus::AnalysisComplete),
        ];
        for (label, expected) in cases {
            let mut state = WorkflowState::default();
            let image = png("scan.png");
            let image_id = image.id();
            state.acquire(image);
            state.begin(ConnectivityState::Connected);

            let completion = state.complete(image_id, ok_response(label, 0.61));
            assert_eq!(completion, Completion::Applied(expected));
            let result = state.result.as_ref().expect("result stored");
            assert_eq!(result.label, PredictionLabel::from_wire(label));
            assert_eq!(result.confidence, 0.61);
        }
    }

    #[test]
    fn machine_discards_completion_for_replaced_image() {
        let mut state = WorkflowState::default();
        let first = png("first.png");
        let first_id = first.id();
        state.acquire(first);
        state.begin(ConnectivityState::Connected);

        state.acquire(png("second.png"));
        let completion = state.complete(first_id, ok_response("Tumor Detected", 0.99));
        assert_eq!(completion, Completion::Stale);
        assert_eq!(state.status, DetectionStatus::ImageReady);
        assert!(state.result.is_none());
    }

    #[test]
    fn machine_discards_completion_after_reset() {
        let mut state = WorkflowState::default();
        let image = png("scan.png");
        let image_id = image.id();
        state.acquire(image);
        state.begin(ConnectivityState::Connected);
        state.reset();

        let completion = state.complete(image_id, ok_response("Tumor Detected", 0.99));
        assert_eq!(completion, Completion::Stale);
        assert_eq!(state.status, DetectionStatus::NoImage);
        assert!(state.result.is_none());
    }

    #[test]
    fn machine_reset_from_every_state() {
        let drive: [fn(&mut WorkflowState); 6] = [
            |_| {},
            |s| {
                s.acquire(png("a.png"));
            },
            |s| {
                s.acquire(png("a.png"));
                s.begin(ConnectivityState::Connected);
            },
            |s| {
                s.acquire(png("a.png"));
                s.begin(ConnectivityState::Disconnected);
            },
            |s| {
                let image = png("a.png");
                let id = image.id();
                s.acquire(image);
                s.begin(ConnectivityState::Connected);
                s.complete(id, ok_response("Tumor Detected", 0.7));
            },
            |s| {
                let image = png("a.png");
                let id = image.id();
                s.acquire(image);
                s.begin(ConnectivityState::Connected);
                s.complete(id, ok_response("Something Else", 0.7));
            },
        ];

        for setup in drive {
            let mut state = WorkflowState::default();
            setup(&mut state);
            state.reset();
            assert_eq!(state.status, DetectionStatus::NoImage);
            assert!(state.image.is_none());
            assert!(state.result.is_none());
            assert!(state.error.is_none());
        }
    }

    #[tokio::test]
    async fn repeated_uploads_always_land_in_image_ready() {
        let (workflow, _predictor, _tx) = workflow_with(ConnectivityState::Disconnected);

        for name in ["a.png", "b.png", "c.png"] {
            workflow.image_acquired(png(name));
            let snapshot = workflow.snapshot();
            assert_eq!(snapshot.status, DetectionStatus::ImageReady);
            assert!(snapshot.result.is_none());
            assert!(snapshot.error.is_none());
            assert_eq!(snapshot.image.unwrap().file_name, name);

            assert_eq!(workflow.start_analysis(), StartOutcome::Blocked);
            assert_eq!(workflow.status(), DetectionStatus::AnalysisFailed);
        }
    }

    #[tokio::test]
    async fn disconnected_start_never_sends_a_request() {
        let (workflow, predictor, _tx) = workflow_with(ConnectivityState::Disconnected);
        workflow.image_acquired(png("scan.png"));

        assert_eq!(workflow.start_analysis(), StartOutcome::Blocked);
        tokio::task::yield_now().await;

        let snapshot = workflow.snapshot();
        assert_eq!(snapshot.status, DetectionStatus::AnalysisFailed);
        assert!(snapshot.error.unwrap().contains("backend not connected"));
        assert_eq!(predictor.predict_calls(), 0);
    }

    #[tokio::test]
    async fn start_without_image_is_rejected() {
        let (workflow, predictor, _tx) = workflow_with(ConnectivityState::Connected);
        assert_eq!(
            workflow.start_analysis(),
            StartOutcome::Rejected(StartRejection::NoImage)
        );
        assert_eq!(workflow.status(), DetectionStatus::NoImage);
        assert_eq!(predictor.predict_calls(), 0);
    }

    #[tokio::test]
    async fn tumor_result_keeps_exact_confidence() {
        let (workflow, predictor, _tx) = workflow_with(ConnectivityState::Connected);
        predictor.respond_with("Tumor Detected", 0.8731);
        let image = png("scan.png");
        let image_id = image.id();
        workflow.image_acquired(image);

        assert_eq!(workflow.start_analysis(), StartOutcome::Started(image_id));
        let snapshot = workflow.wait_until_settled().await;

        assert_eq!(snapshot.status, DetectionStatus::TumorDetected);
        let result = snapshot.result.unwrap();
        assert_eq!(result.confidence, 0.8731);
        assert_eq!(result.image_id, image_id);
        assert_eq!(predictor.predict_calls(), 1);
        assert_eq!(predictor.uploads()[0].id(), image_id);
    }

    #[tokio::test]
    async fn no_tumor_result_displays_whole_percent() {
        let (workflow, predictor, _tx) = workflow_with(ConnectivityState::Connected);
        predictor.push_response(Ok(PredictResponse {
            prediction: "No Tumor Detected".to_string(),
            confidence: 0.93,
            threshold: None,
        }));

        let snapshot = workflow.image_acquired(png("scan.png"));
        assert_eq!(snapshot.status, DetectionStatus::ImageReady);
        assert!(matches!(workflow.start_analysis(), StartOutcome::Started(_)));

        let snapshot = workflow.wait_until_settled().await;
        assert_eq!(snapshot.status, DetectionStatus::NoTumorDetected);
        assert_eq!(snapshot.confidence_percent().as_deref(), Some("93%"));
    }

    #[tokio::test]
    async fn http_error_fails_without_result() {
        let (workflow, predictor, _tx) = workflow_with(ConnectivityState::Connected);
        predictor.push_response(Err(PredictError::Status {
            status: 500,
            detail: None,
        }));
        workflow.image_acquired(png("scan.png"));
        workflow.start_analysis();

        let snapshot = workflow.wait_until_settled().await;
        assert_eq!(snapshot.status, DetectionStatus::AnalysisFailed);
        let error = snapshot.error.unwrap();
        assert!(error.contains("500"), "got: {error}");
        assert!(snapshot.result.is_none());
    }

    #[tokio::test]
    async fn transport_error_message_is_surfaced() {
        let (workflow, predictor, _tx) = workflow_with(ConnectivityState::Connected);
        predictor.push_response(Err(PredictError::Transport(
            "connection reset by peer".to_string(),
        )));
        workflow.image_acquired(png("scan.png"));
        workflow.start_analysis();

        let snapshot = workflow.wait_until_settled().await;
        assert_eq!(snapshot.status, DetectionStatus::AnalysisFailed);
        assert!(snapshot.error.unwrap().contains("connection reset by peer"));
    }

    #[tokio::test]
    async fn second_start_while_analyzing_sends_nothing() {
        let (workflow, predictor, _tx) = workflow_with(ConnectivityState::Connected);
        predictor.hold_predictions();
        predictor.respond_with("Tumor Detected", 0.9);
        workflow.image_acquired(png("scan.png"));

        assert!(matches!(workflow.start_analysis(), StartOutcome::Started(_)));
        assert_eq!(
            workflow.start_analysis(),
            StartOutcome::Rejected(StartRejection::AlreadyAnalyzing)
        );

        predictor.release_one();
        let snapshot = workflow.wait_until_settled().await;
        assert_eq!(snapshot.status, DetectionStatus::TumorDetected);
        assert_eq!(predictor.predict_calls(), 1);
    }

    #[tokio::test]
    async fn connectivity_flip_does_not_interrupt_request_in_flight() {
        let (workflow, predictor, tx) = workflow_with(ConnectivityState::Connected);
        predictor.hold_predictions();
        predictor.respond_with("No Tumor Detected", 0.8);
        workflow.image_acquired(png("scan.png"));
        workflow.start_analysis();

        tx.send_replace(ConnectivityState::Disconnected);
        tokio::task::yield_now().await;
        assert_eq!(workflow.status(), DetectionStatus::Analyzing);

        predictor.release_one();
        let snapshot = workflow.wait_until_settled().await;
        assert_eq!(snapshot.status, DetectionStatus::NoTumorDetected);
    }

    #[tokio::test]
    async fn stale_response_after_reset_is_ignored() {
        let (workflow, predictor, _tx) = workflow_with(ConnectivityState::Connected);
        predictor.hold_predictions();
        predictor.respond_with("Tumor Detected", 0.95);
        workflow.image_acquired(png("scan.png"));
        workflow.start_analysis();
        tokio::task::yield_now().await;

        workflow.reset();
        predictor.release_one();

        // give the background request a chance to land
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = workflow.snapshot();
        assert_eq!(snapshot.status, DetectionStatus::NoImage);
        assert!(snapshot.result.is_none());
        assert!(snapshot.image.is_none());
    }

    #[tokio::test]
    async fn stale_response_after_replace_does_not_touch_new_image() {
        let (workflow, predictor, _tx) = workflow_with(ConnectivityState::Connected);
        predictor.hold_predictions();
        predictor.respond_with("Tumor Detected", 0.95);
        workflow.image_acquired(png("first.png"));
        workflow.start_analysis();
        tokio::task::yield_now().await;

        let replacement = png("second.png");
        let replacement_id = replacement.id();
        workflow.image_acquired(replacement);
        predictor.release_one();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = workflow.snapshot();
        assert_eq!(snapshot.status, DetectionStatus::ImageReady);
        assert_eq!(snapshot.image.unwrap().id, replacement_id);
        assert!(snapshot.result.is_none());
    }

    #[tokio::test]
    async fn failed_analysis_can_be_retried_with_same_image() {
        let (workflow, predictor, tx) = workflow_with(ConnectivityState::Disconnected);
        let image = png("scan.png");
        let image_id = image.id();
        workflow.image_acquired(image);
        assert_eq!(workflow.start_analysis(), StartOutcome::Blocked);

        tx.send_replace(ConnectivityState::Connected);
        predictor.respond_with("No Tumor Detected", 0.93);
        assert_eq!(workflow.start_analysis(), StartOutcome::Started(image_id));
        assert!(workflow.snapshot().error.is_none());

        let snapshot = workflow.wait_until_settled().await;
        assert_eq!(snapshot.status, DetectionStatus::NoTumorDetected);
    }

    #[tokio::test]
    async fn subscribers_observe_each_transition() {
        let (workflow, predictor, _tx) = workflow_with(ConnectivityState::Connected);
        predictor.hold_predictions();
        predictor.respond_with("Tumor Detected", 0.9);
        let mut rx = workflow.subscribe();

        workflow.image_acquired(png("scan.png"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().status, DetectionStatus::ImageReady);

        workflow.start_analysis();
        assert_eq!(rx.borrow_and_update().status, DetectionStatus::Analyzing);

        predictor.release_one();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().status, DetectionStatus::TumorDetected);
    }
}
