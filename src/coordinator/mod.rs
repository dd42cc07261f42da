//! Round coordination.
//!
//! The [`Coordinator`] drives the training rounds:
//!
//! ```text
//! Idle -> AwaitingClients -> RunningRound(n) -> Aggregating -> Idle -> RunningRound(n + 1) ...
//! ```
//!
//! The clients it selects from are registered concurrently by the
//! [`RegistrationService`], through the shared [`ClientDirectory`].

pub mod aggregation;
pub mod directory;
pub mod dispatch;
pub mod registration;
pub mod selection;

use std::{cmp, time::Duration};

use derive_more::Display;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing_futures::Instrument;

pub use self::{
    aggregation::{
        AggregationError,
        Aggregator,
        MetricSummary,
        MetricsAggregator,
        ModelAggregator,
    },
    directory::{ClientDirectory, ClientRecord},
    dispatch::{DispatchError, Dispatcher},
    registration::{RegistrationError, RegistrationService},
    selection::{RandomSelector, Selector},
};
use crate::{
    message::{ClientId, ModelState, RoundRequest, RoundResult},
    settings::CoordinatorSettings,
    utils::Shutdown,
};

/// The number of warm-up polls between two logs of the registered clients.
const WARMUP_LOG_EVERY: u32 = 3;

/// Name of the current phase.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub enum PhaseName {
    Idle,
    AwaitingClients,
    #[display(fmt = "RunningRound({})", _0)]
    RunningRound(u64),
    Aggregating,
    Shutdown,
}

/// The outcome of a round.
///
/// When no participant responded, all the averages are `0`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundMetrics {
    pub round: u64,
    /// The number of participants the round request was sent to.
    pub selected: usize,
    /// The number of results that were aggregated.
    pub responded: usize,
    /// The number of selected participants that were excluded.
    pub failed: usize,
    pub total_samples: u64,
    pub mean_loss: f64,
    pub mean_accuracy: f64,
    pub weighted_loss: f64,
    pub weighted_accuracy: f64,
    /// Whether the global model state changed during the round.
    pub model_updated: bool,
}

impl RoundMetrics {
    fn new(round: u64, selected: usize, summary: MetricSummary, model_updated: bool) -> Self {
        Self {
            round,
            selected,
            responded: summary.responded,
            failed: selected - summary.responded,
            total_samples: summary.total_samples,
            mean_loss: summary.mean_loss,
            mean_accuracy: summary.mean_accuracy,
            weighted_loss: summary.weighted_loss,
            weighted_accuracy: summary.weighted_accuracy,
            model_updated,
        }
    }
}

#[derive(Debug, Error)]
/// Reasons for excluding a result from the aggregation.
pub enum RejectedResult {
    #[error("result for round {found} received during round {expected}")]
    RoundMismatch { expected: u64, found: u64 },
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

/// Runs the training rounds over the registered clients.
///
/// The round counter is only ever mutated through `&mut self`, so two rounds
/// of the same coordinator cannot overlap.
pub struct Coordinator<S = RandomSelector> {
    directory: ClientDirectory,
    selector: S,
    dispatcher: Dispatcher,
    settings: CoordinatorSettings,
    round: u64,
    phase: PhaseName,
    global_state: ModelState,
    shutdown: Shutdown,
}

impl<S> Coordinator<S>
where
    S: Selector,
{
    pub fn new(
        directory: ClientDirectory,
        selector: S,
        settings: CoordinatorSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            directory,
            selector,
            dispatcher: Dispatcher::new(settings.dispatch_timeout()),
            settings,
            round: 0,
            phase: PhaseName::Idle,
            global_state: ModelState::new(),
            shutdown,
        }
    }

    /// Set the initial global model state, sent to the participants of the
    /// first round.
    pub fn with_global_state(mut self, state: ModelState) -> Self {
        self.global_state = state;
        self
    }

    pub fn phase(&self) -> PhaseName {
        self.phase
    }

    /// The number of the last round that was started, `0` before the first
    /// round.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// The current global model state.
    pub fn global_state(&self) -> &ModelState {
        &self.global_state
    }

    /// Give the clients time to register before the first round.
    ///
    /// Unless `force` is set, this waits for the configured warm-up duration
    /// and logs the number of registered clients regularly. Training starts
    /// even if no client registered.
    ///
    /// # Returns
    /// The number of registered clients.
    pub async fn await_clients(&mut self, force: bool) -> usize {
        self.phase = PhaseName::AwaitingClients;
        if force {
            let registered = self.directory.len().await;
            info!("skipping warm-up with {} registered clients", registered);
            return registered;
        }

        let warmup = self.settings.warmup();
        info!("waiting {:?} for clients to register", warmup);
        let deadline = Instant::now() + warmup;
        let poll = cmp::min(Duration::from_secs(1), warmup);
        let mut polls = 0_u32;
        while !self.shutdown.is_triggered() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(cmp::min(poll, deadline - now)).await;
            polls += 1;
            if polls % WARMUP_LOG_EVERY == 0 {
                info!("{} clients registered", self.directory.len().await);
            }
        }

        let registered = self.directory.len().await;
        if registered == 0 {
            warn!("no client registered during warm-up, training anyway");
        } else {
            info!("warm-up done with {} registered clients", registered);
        }
        registered
    }

    /// Run a single round with at most `clients_per_round` participants.
    ///
    /// Participants that fail, time out or send an invalid result are
    /// excluded from the round. If the model states cannot be aggregated,
    /// the previous global state is kept. A round therefore always
    /// completes.
    pub async fn run_round(&mut self, clients_per_round: usize) -> RoundMetrics {
        self.round += 1;
        let round = self.round;
        self.phase = PhaseName::RunningRound(round);

        let metrics = self
            .execute_round(round, clients_per_round)
            .instrument(info_span!("round", round))
            .await;

        self.phase = PhaseName::Idle;
        metrics
    }

    async fn execute_round(&mut self, round: u64, clients_per_round: usize) -> RoundMetrics {
        if let Some(max_age) = self.settings.stale_after() {
            let evicted = self.directory.evict_stale(max_age).await;
            if !evicted.is_empty() {
                info!("evicted {} stale clients: {}", evicted.len(), join_ids(&evicted));
            }
        }

        let candidates = self.directory.snapshot().await;
        let available = candidates.len();
        let selected = self.selector.select(clients_per_round, candidates);
        if selected.is_empty() {
            warn!("no client available");
        } else {
            let ids: Vec<ClientId> = selected.iter().map(|client| client.id.clone()).collect();
            info!(
                "selected {} of {} clients: {}",
                selected.len(),
                available,
                join_ids(&ids)
            );
        }

        let request = RoundRequest::train(round, self.global_state.clone());
        let outcomes = self.dispatcher.dispatch_all(&selected, &request).await;

        self.phase = PhaseName::Aggregating;
        let mut metrics = MetricsAggregator::new();
        let mut model = ModelAggregator::new(&self.global_state);
        let mut model_error = None;
        for (id, outcome) in outcomes {
            let result = match outcome {
                Ok(result) => result,
                Err(err) => {
                    warn!("client {} excluded: {}", id, err);
                    continue;
                }
            };
            if let Err(err) = self.accept_result(round, &result, &mut metrics) {
                warn!("result of client {} rejected: {}", id, err);
                continue;
            }
            debug!(
                "client {} trained on {} samples: loss {:.4}, accuracy {:.4}",
                id, result.sample_count, result.loss, result.accuracy
            );
            if model_error.is_none() {
                model_error = model.add_local_result(&result).err();
            }
        }

        let summary = metrics.aggregate().unwrap_or_default();
        let model_updated = match model_error {
            Some(err) => {
                warn!("keeping the previous global model: {}", err);
                false
            }
            None => self.update_global_state(model),
        };

        let metrics = RoundMetrics::new(round, selected.len(), summary, model_updated);
        info!(
            "round completed: {}/{} responded, loss {:.4} (weighted {:.4}), accuracy {:.4} (weighted {:.4})",
            metrics.responded,
            metrics.selected,
            metrics.mean_loss,
            metrics.weighted_loss,
            metrics.mean_accuracy,
            metrics.weighted_accuracy,
        );
        metrics
    }

    fn accept_result(
        &self,
        round: u64,
        result: &RoundResult,
        metrics: &mut MetricsAggregator,
    ) -> Result<(), RejectedResult> {
        if self.settings.enforce_round_match && result.round != round {
            return Err(RejectedResult::RoundMismatch {
                expected: round,
                found: result.round,
            });
        }
        metrics.add_local_result(result)?;
        Ok(())
    }

    fn update_global_state(&mut self, mut model: ModelAggregator) -> bool {
        match model.aggregate() {
            Ok(Some(state)) => {
                debug!("global model updated from {} states", model.len());
                self.global_state = state;
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!("keeping the previous global model: {}", err);
                false
            }
        }
    }

    /// Run `rounds` rounds, pausing between two of them.
    ///
    /// Stops early if the shutdown flag is raised, in which case the
    /// coordinator ends in the [`PhaseName::Shutdown`] phase.
    ///
    /// # Returns
    /// The metrics of the rounds that were run.
    pub async fn run(&mut self, rounds: u64, clients_per_round: usize) -> Vec<RoundMetrics> {
        let mut history = Vec::new();
        for index in 0..rounds {
            if index > 0 {
                sleep(self.settings.round_pause()).await;
            }
            if self.shutdown.is_triggered() {
                break;
            }
            history.push(self.run_round(clients_per_round).await);
        }

        if self.shutdown.is_triggered() {
            self.phase = PhaseName::Shutdown;
            info!("shut down after {} rounds", history.len());
        } else if let Some(last) = history.last() {
            info!(
                "training completed after {} rounds, final accuracy {:.4}",
                history.len(),
                last.weighted_accuracy
            );
        }
        history
    }
}

fn join_ids(ids: &[ClientId]) -> String {
    ids.iter()
        .map(ClientId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::{io::AsyncWriteExt, net::TcpListener};

    use super::*;
    use crate::{
        channel,
        coordinator::selection::MockSelector,
        message::Parameter,
    };

    fn settings() -> CoordinatorSettings {
        CoordinatorSettings {
            warmup: 0.2,
            round_pause: 0.0,
            dispatch_timeout: 1.0,
            ..CoordinatorSettings::default()
        }
    }

    fn coordinator(directory: ClientDirectory) -> Coordinator {
        Coordinator::new(
            directory,
            RandomSelector::seeded(7),
            settings(),
            Shutdown::new(),
        )
    }

    /// A participant answering one request with the result built by `answer`.
    async fn participant<F>(answer: F) -> SocketAddr
    where
        F: FnOnce(RoundRequest) -> RoundResult + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request: RoundRequest = channel::receive(&mut stream).await.unwrap();
            channel::send(&mut stream, &answer(request)).await.unwrap();
        });
        addr
    }

    /// A participant answering one request with an undecodable frame.
    async fn garbage() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _: RoundRequest = channel::receive(&mut stream).await.unwrap();
            stream.write_all(&3_u32.to_be_bytes()).await.unwrap();
            stream.write_all(&[0xba, 0xad, 0xf0]).await.unwrap();
        });
        addr
    }

    fn answer(request: RoundRequest, sample_count: u64, accuracy: f64) -> RoundResult {
        RoundResult {
            round: request.round,
            sample_count,
            loss: 1.0 - accuracy,
            accuracy,
            state: request.state,
        }
    }

    #[test]
    fn test_phase_name_display() {
        assert_eq!(PhaseName::Idle.to_string(), "Idle");
        assert_eq!(PhaseName::RunningRound(3).to_string(), "RunningRound(3)");
    }

    #[tokio::test]
    async fn test_rounds_without_clients() {
        let mut coordinator = coordinator(ClientDirectory::new());
        assert_eq!(coordinator.phase(), PhaseName::Idle);

        for expected in 1..=3 {
            let metrics = coordinator.run_round(4).await;
            assert_eq!(metrics.round, expected);
            assert_eq!(metrics.selected, 0);
            assert_eq!(metrics.responded, 0);
            assert_eq!(metrics.mean_accuracy, 0.0);
            assert_eq!(metrics.weighted_loss, 0.0);
            assert!(!metrics.model_updated);
            assert_eq!(coordinator.phase(), PhaseName::Idle);
        }
        assert_eq!(coordinator.round(), 3);
    }

    #[tokio::test]
    async fn test_round_with_clients() {
        let directory = ClientDirectory::new();
        let first = participant(|request| answer(request, 10, 0.2)).await;
        let second = participant(|request| answer(request, 30, 0.8)).await;
        directory
            .upsert(ClientRecord::new("vehicle_00".into(), first, 10))
            .await;
        directory
            .upsert(ClientRecord::new("vehicle_01".into(), second, 30))
            .await;

        let mut coordinator = coordinator(directory);
        let metrics = coordinator.run_round(4).await;
        assert_eq!(metrics.selected, 2);
        assert_eq!(metrics.responded, 2);
        assert_eq!(metrics.failed, 0);
        assert_eq!(metrics.total_samples, 40);
        assert!((metrics.mean_accuracy - 0.5).abs() < 1e-9);
        assert!((metrics.weighted_accuracy - 0.65).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_round_mismatch_is_rejected() {
        let directory = ClientDirectory::new();
        let stale = participant(|request| RoundResult {
            round: request.round + 1,
            ..answer(request, 10, 0.9)
        })
        .await;
        let fresh = participant(|request| answer(request, 10, 0.5)).await;
        directory
            .upsert(ClientRecord::new("vehicle_00".into(), stale, 10))
            .await;
        directory
            .upsert(ClientRecord::new("vehicle_01".into(), fresh, 10))
            .await;

        let mut coordinator = coordinator(directory);
        let metrics = coordinator.run_round(2).await;
        assert_eq!(metrics.responded, 1);
        assert_eq!(metrics.failed, 1);
        assert!((metrics.mean_accuracy - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sample_overflow_is_rejected() {
        let half = u64::MAX / 2 + 1;
        let directory = ClientDirectory::new();
        let first = participant(move |request| answer(request, half, 0.6)).await;
        let second = participant(move |request| answer(request, half, 0.6)).await;
        directory
            .upsert(ClientRecord::new("vehicle_00".into(), first, 10))
            .await;
        directory
            .upsert(ClientRecord::new("vehicle_01".into(), second, 10))
            .await;

        let mut coordinator = coordinator(directory);
        let metrics = coordinator.run_round(4).await;
        assert_eq!(metrics.selected, 2);
        assert_eq!(metrics.responded, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.total_samples, half);
        assert!((metrics.weighted_accuracy - 0.6).abs() < 1e-9);
        assert_eq!(coordinator.phase(), PhaseName::Idle);
    }

    #[tokio::test]
    async fn test_undecodable_result_excludes_client() {
        let directory = ClientDirectory::new();
        let broken = garbage().await;
        let healthy = participant(|request| answer(request, 20, 0.75)).await;
        directory
            .upsert(ClientRecord::new("vehicle_00".into(), broken, 10))
            .await;
        directory
            .upsert(ClientRecord::new("vehicle_01".into(), healthy, 20))
            .await;

        let mut coordinator = coordinator(directory);
        let metrics = coordinator.run_round(4).await;
        assert_eq!(metrics.selected, 2);
        assert_eq!(metrics.responded, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.total_samples, 20);
        assert!((metrics.weighted_accuracy - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_overflowing_shape_excludes_client() {
        let directory = ClientDirectory::new();
        let broken = participant(|request| {
            let mut state = ModelState::new();
            state.insert(
                "dense.weight",
                Parameter::Float {
                    shape: vec![1 << 40, 1 << 40],
                    values: Vec::new(),
                },
            );
            RoundResult {
                state,
                ..answer(request, 10, 0.9)
            }
        })
        .await;
        let healthy = participant(|request| answer(request, 10, 0.5)).await;
        directory
            .upsert(ClientRecord::new("vehicle_00".into(), broken, 10))
            .await;
        directory
            .upsert(ClientRecord::new("vehicle_01".into(), healthy, 10))
            .await;

        let mut coordinator = coordinator(directory);
        let metrics = coordinator.run_round(4).await;
        assert_eq!(metrics.responded, 1);
        assert_eq!(metrics.failed, 1);
        assert!((metrics.mean_accuracy - 0.5).abs() < 1e-9);
        assert!(!metrics.model_updated);
    }

    #[tokio::test]
    async fn test_global_state_is_aggregated() {
        let mut initial = ModelState::new();
        initial.insert("dense.weight", Parameter::float(vec![1], vec![0.0]).unwrap());

        let directory = ClientDirectory::new();
        let addr = participant(|request| {
            let mut state = ModelState::new();
            state.insert("dense.weight", Parameter::float(vec![1], vec![0.5]).unwrap());
            RoundResult {
                state,
                ..answer(request, 10, 0.5)
            }
        })
        .await;
        directory
            .upsert(ClientRecord::new("vehicle_00".into(), addr, 10))
            .await;

        let mut coordinator = coordinator(directory).with_global_state(initial);
        let metrics = coordinator.run_round(1).await;
        assert!(metrics.model_updated);
        assert_eq!(
            coordinator.global_state().get("dense.weight"),
            Some(&Parameter::float(vec![1], vec![0.5]).unwrap())
        );
    }

    #[tokio::test]
    async fn test_incompatible_state_keeps_global_state() {
        let mut initial = ModelState::new();
        initial.insert("dense.weight", Parameter::float(vec![2], vec![0.0, 0.0]).unwrap());

        let directory = ClientDirectory::new();
        let addr = participant(|request| {
            let mut state = ModelState::new();
            state.insert("dense.weight", Parameter::float(vec![1], vec![0.5]).unwrap());
            RoundResult {
                state,
                ..answer(request, 10, 0.5)
            }
        })
        .await;
        directory
            .upsert(ClientRecord::new("vehicle_00".into(), addr, 10))
            .await;

        let mut coordinator = coordinator(directory).with_global_state(initial.clone());
        let metrics = coordinator.run_round(1).await;
        assert_eq!(metrics.responded, 1);
        assert!(!metrics.model_updated);
        assert_eq!(coordinator.global_state(), &initial);
    }

    #[tokio::test]
    async fn test_selector_is_asked_for_clients_per_round() {
        let directory = ClientDirectory::new();
        directory
            .upsert(ClientRecord::new(
                "vehicle_00".into(),
                ([127, 0, 0, 1], 1).into(),
                10,
            ))
            .await;

        let mut selector = MockSelector::new();
        selector
            .expect_select()
            .withf(|count, candidates| *count == 4 && candidates.len() == 1)
            .times(1)
            .returning(|_, _| Vec::new());

        let mut coordinator = Coordinator::new(directory, selector, settings(), Shutdown::new());
        let metrics = coordinator.run_round(4).await;
        assert_eq!(metrics.selected, 0);
    }

    #[tokio::test]
    async fn test_await_clients() {
        let directory = ClientDirectory::new();
        let mut coordinator = coordinator(directory.clone());
        assert_eq!(coordinator.await_clients(false).await, 0);
        assert_eq!(coordinator.phase(), PhaseName::AwaitingClients);

        directory
            .upsert(ClientRecord::new(
                "vehicle_00".into(),
                ([127, 0, 0, 1], 1).into(),
                10,
            ))
            .await;
        assert_eq!(coordinator.await_clients(true).await, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let shutdown = Shutdown::new();
        let mut coordinator = Coordinator::new(
            ClientDirectory::new(),
            RandomSelector::new(),
            settings(),
            shutdown.clone(),
        );

        assert_eq!(coordinator.run(2, 4).await.len(), 2);
        assert_eq!(coordinator.phase(), PhaseName::Idle);

        shutdown.trigger();
        assert!(coordinator.run(2, 4).await.is_empty());
        assert_eq!(coordinator.phase(), PhaseName::Shutdown);
        assert_eq!(coordinator.round(), 2);
    }
}
