//! Local training.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;

use crate::message::{ModelState, RoundRequest};

/// The outcome of a local training.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUpdate {
    pub loss: f64,
    pub accuracy: f64,
    /// The locally trained model state. It may be empty.
    pub state: ModelState,
}

#[derive(Debug, Error)]
#[error("local training failed: {0}")]
/// A failed local training.
pub struct ComputeError(pub String);

/// The training capability of a participant.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LocalCompute: Send + Sync {
    /// Train on the local data, starting from the state carried by the
    /// request.
    async fn compute(&self, request: &RoundRequest) -> Result<LocalUpdate, ComputeError>;
}

#[async_trait]
impl<F> LocalCompute for F
where
    F: Fn(&RoundRequest) -> Result<LocalUpdate, ComputeError> + Send + Sync,
{
    async fn compute(&self, request: &RoundRequest) -> Result<LocalUpdate, ComputeError> {
        self(request)
    }
}

/// A stand-in for an actual training.
///
/// It waits for the configured delay and reports an accuracy growing with
/// the round number, up to `0.95`, with some noise:
///
/// ```text
/// accuracy = min(0.95, 0.45 + 0.02 * round + U(-0.05, 0.05))
/// loss     = max(0.1, 1.0 - 0.05 * round)
/// ```
///
/// The model state of the request is returned unchanged.
#[derive(Debug, Clone)]
pub struct SimulatedTraining {
    delay: Duration,
}

impl SimulatedTraining {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl LocalCompute for SimulatedTraining {
    async fn compute(&self, request: &RoundRequest) -> Result<LocalUpdate, ComputeError> {
        let noise = rand::thread_rng().gen_range(-0.05..0.05);
        sleep(self.delay).await;

        let round = request.round as f64;
        Ok(LocalUpdate {
            loss: (1.0 - 0.05 * round).max(0.1),
            accuracy: (0.45 + 0.02 * round + noise).min(0.95),
            state: request.state.clone(),
        })
    }
}
