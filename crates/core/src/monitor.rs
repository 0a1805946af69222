//! Background liveness tracking for the remote predictor.
//!
//! The monitor is the only writer of [`ConnectivityState`]; everything else
//! holds a `watch::Receiver` and reads it when it needs to decide something.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PredictorConfig;
use crate::predictor::Predictor;
use crate::types::ConnectivityState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&PredictorConfig::default())
    }
}

impl From<&PredictorConfig> for MonitorSettings {
    fn from(config: &PredictorConfig) -> Self {
        Self {
            probe_interval: config.probe_interval(),
            probe_timeout: config.probe_timeout(),
        }
    }
}

pub struct ConnectivityMonitor<P> {
    prober: Arc<Prober<P>>,
    probe_interval: Duration,
    task: Mutex<Option<MonitorTask>>,
}

struct MonitorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Prober<P> {
    predictor: Arc<P>,
    probe_timeout: Duration,
    state: watch::Sender<ConnectivityState>,
}

impl<P: Predictor> ConnectivityMonitor<P> {
    pub fn new(predictor: Arc<P>, settings: MonitorSettings) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Checking);
        Self {
            prober: Arc::new(Prober {
                predictor,
                probe_timeout: settings.probe_timeout,
                state,
            }),
            probe_interval: settings.probe_interval,
            task: Mutex::new(None),
        }
    }

    pub fn current(&self) -> ConnectivityState {
        *self.prober.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.prober.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Probe now, then keep re-probing every interval until stopped.
    /// Calling it on a running monitor does nothing.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_probe_loop(
            self.prober.clone(),
            self.probe_interval,
            cancel.clone(),
        ));
        info!(
            interval_secs = self.probe_interval.as_secs_f64(),
            timeout_secs = self.prober.probe_timeout.as_secs_f64(),
            "Connectivity monitor started"
        );
        *task = Some(MonitorTask { cancel, handle });
    }

    /// Stops the probe loop and waits for it to exit. A probe already in
    /// flight finishes first; it is bounded by the probe timeout.
    pub async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };

        task.cancel.cancel();
        if let Err(error) = task.handle.await {
            debug!(error = %error, "Connectivity monitor task ended abnormally");
        }
        info!("Connectivity monitor stopped");
    }

    /// One liveness probe, publishing `Checking` while it is outstanding.
    pub async fn probe(&self) -> ConnectivityState {
        self.prober.probe().await
    }

    /// User-requested recheck, typically after seeing `Disconnected`.
    pub async fn retry(&self) -> ConnectivityState {
        info!("Connectivity recheck requested");
        self.probe().await
    }
}

impl<P> Drop for ConnectivityMonitor<P> {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = task.take() {
            task.cancel.cancel();
        }
    }
}

async fn run_probe_loop<P: Predictor>(
    prober: Arc<Prober<P>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    if cancel.is_cancelled() {
        return;
    }
    prober.probe().await;

    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                prober.refresh().await;
            }
        }
    }
}

impl<P: Predictor> Prober<P> {
    async fn probe(&self) -> ConnectivityState {
        self.publish(ConnectivityState::Checking);
        self.refresh().await
    }

    /// Probe without announcing `Checking`; only the outcome is published.
    async fn refresh(&self) -> ConnectivityState {
        let next = match time::timeout(self.probe_timeout, self.predictor.check_health()).await {
            Ok(Ok(())) => ConnectivityState::Connected,
            Ok(Err(error)) => {
                debug!(error = %error, "Predictor health probe failed");
                ConnectivityState::Disconnected
            }
            Err(_) => {
                debug!(
                    timeout_secs = self.probe_timeout.as_secs_f64(),
                    "Predictor health probe timed out"
                );
                ConnectivityState::Disconnected
            }
        };

        self.publish(next);
        next
    }

    fn publish(&self, next: ConnectivityState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });

        if changed && next != ConnectivityState::Checking {
            info!(from = %previous, to = %next, "Predictor connectivity changed");
        }
    }
}
