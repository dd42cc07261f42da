//! The participant worker.
//!
//! A [`Participant`] registers with the coordinator, then listens on its
//! callback port for round requests. Every request is answered on the
//! connection it arrived on, after the local training completes:
//!
//! ```text
//! Disconnected -> Registering -> Listening -> Training(n) -> Listening -> ... -> Stopped
//! ```

pub mod compute;
pub mod history;

use std::{io, time::Duration};

use derive_more::Display;
use rand::Rng;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tracing_futures::Instrument;

pub use self::{
    compute::{ComputeError, LocalCompute, LocalUpdate, SimulatedTraining},
    history::{TrainingHistory, TrainingRecord, HISTORY_WINDOW},
};
use crate::{
    channel::{self, ChannelError},
    message::{
        Action,
        ClientId,
        ModelStateError,
        RegistrationReply,
        RegistrationRequest,
        RegistrationStatus,
        RoundRequest,
        RoundResult,
    },
    settings::{ApiSettings, ParticipantSettings},
    utils::Shutdown,
};

/// The offset between the coordinator's port and the participants' ports.
const CALLBACK_PORT_OFFSET: u16 = 100;

/// Name of the current phase of a participant.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub enum ParticipantPhase {
    Disconnected,
    Registering,
    Listening,
    #[display(fmt = "Training({})", _0)]
    Training(u64),
    Stopped,
}

#[derive(Debug, Error)]
/// Participant errors.
pub enum ParticipantError {
    #[error("failed to bind the callback address: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to connect to the coordinator: {0}")]
    Connect(#[source] io::Error),
    #[error("exchange failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("no answer after {0:?}")]
    Timeout(Duration),
    #[error("registration rejected by the coordinator")]
    Rejected,
    #[error("registration failed after {attempts} attempts: {source}")]
    Registration {
        attempts: u32,
        #[source]
        source: Box<ParticipantError>,
    },
    #[error(transparent)]
    Compute(#[from] ComputeError),
    #[error("invalid model state: {0}")]
    InvalidState(#[from] ModelStateError),
}

/// The callback port of a participant: the coordinator's port, plus `100`,
/// plus the number ending the participant's id (`0` if there is none).
///
/// ```rust
/// # use fedroute::{message::ClientId, participant::default_callback_port};
/// assert_eq!(default_callback_port(&ClientId::new("vehicle_03"), 8080), 8183);
/// ```
pub fn default_callback_port(id: &ClientId, server_port: u16) -> u16 {
    server_port
        .saturating_add(CALLBACK_PORT_OFFSET)
        .saturating_add(id.index().unwrap_or(0))
}

/// A participant of the federated training.
pub struct Participant<C> {
    id: ClientId,
    sample_count: u64,
    coordinator: String,
    callback_port: u16,
    settings: ParticipantSettings,
    compute: C,
    history: TrainingHistory,
    phase: ParticipantPhase,
    shutdown: Shutdown,
}

impl<C> Participant<C>
where
    C: LocalCompute,
{
    /// Create a participant of the coordinator at `api`.
    ///
    /// Unless set in the settings, the sample count is drawn at random and
    /// the callback port is derived from the id.
    pub fn new(
        id: ClientId,
        api: &ApiSettings,
        settings: ParticipantSettings,
        compute: C,
        shutdown: Shutdown,
    ) -> Self {
        let sample_count = settings
            .sample_count
            .unwrap_or_else(|| rand::thread_rng().gen_range(50..200));
        let callback_port = settings
            .callback_port
            .unwrap_or_else(|| default_callback_port(&id, api.port));
        Self {
            id,
            sample_count,
            coordinator: api.address(),
            callback_port,
            settings,
            compute,
            history: TrainingHistory::new(),
            phase: ParticipantPhase::Disconnected,
            shutdown,
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn callback_port(&self) -> u16 {
        self.callback_port
    }

    pub fn phase(&self) -> ParticipantPhase {
        self.phase
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// Register and serve round requests until the shutdown flag is raised.
    ///
    /// # Errors
    /// Fails if the registration or the binding of the callback address
    /// fails.
    pub async fn run(&mut self) -> Result<(), ParticipantError> {
        self.register().await?;
        self.listen().await
    }

    /// Register with the coordinator.
    ///
    /// A failed or rejected attempt is retried after the configured backoff,
    /// up to the configured number of attempts.
    ///
    /// # Errors
    /// Fails with [`ParticipantError::Registration`] once all the attempts
    /// failed.
    pub async fn register(&mut self) -> Result<RegistrationReply, ParticipantError> {
        self.phase = ParticipantPhase::Registering;
        let attempts = self.settings.registration_attempts;
        let attempt_timeout = self.settings.registration_timeout();
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(
                "registering with {} ({}/{})",
                self.coordinator, attempt, attempts
            );
            let error = match timeout(attempt_timeout, self.try_register()).await {
                Ok(Ok(reply)) => {
                    info!(
                        "registered with {} samples, coordinator time {:.3}",
                        self.sample_count, reply.server_time
                    );
                    return Ok(reply);
                }
                Ok(Err(err)) => err,
                Err(_) => ParticipantError::Timeout(attempt_timeout),
            };
            warn!("registration attempt {} failed: {}", attempt, error);

            if attempt >= attempts || self.shutdown.is_triggered() {
                self.phase = ParticipantPhase::Disconnected;
                return Err(ParticipantError::Registration {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }
            sleep(self.settings.registration_backoff()).await;
        }
    }

    async fn try_register(&self) -> Result<RegistrationReply, ParticipantError> {
        let mut stream = TcpStream::connect(self.coordinator.as_str())
            .await
            .map_err(ParticipantError::Connect)?;
        let request = RegistrationRequest {
            identity: self.id.clone(),
            sample_count: self.sample_count,
            callback_port: self.callback_port,
        };
        channel::send(&mut stream, &request).await?;
        let reply: RegistrationReply = channel::receive(&mut stream).await?;
        match reply.status {
            RegistrationStatus::Connected => Ok(reply),
            RegistrationStatus::Rejected => Err(ParticipantError::Rejected),
        }
    }

    /// Bind the callback address and serve round requests.
    ///
    /// # Errors
    /// Fails if the callback address cannot be bound.
    pub async fn listen(&mut self) -> Result<(), ParticipantError> {
        let listener = TcpListener::bind((self.settings.listen_host.as_str(), self.callback_port))
            .await
            .map_err(ParticipantError::Bind)?;
        self.serve(listener).await;
        Ok(())
    }

    /// Serve round requests on the given listener, one connection at a time,
    /// until the shutdown flag is raised.
    pub async fn serve(&mut self, listener: TcpListener) {
        self.phase = ParticipantPhase::Listening;
        match listener.local_addr() {
            Ok(addr) => info!("listening for round requests on {}", addr),
            Err(_) => info!("listening for round requests"),
        }

        let idle_timeout = self.settings.idle_timeout();
        while !self.shutdown.is_triggered() {
            let (stream, peer) = match timeout(idle_timeout, listener.accept()).await {
                Err(_) => {
                    debug!("no round request for {:?}", idle_timeout);
                    continue;
                }
                Ok(Err(err)) => {
                    warn!("failed to accept a connection: {}", err);
                    continue;
                }
                Ok(Ok(accepted)) => accepted,
            };

            let span = debug_span!("round_request", peer = %peer);
            if let Err(err) = self.handle_connection(stream).instrument(span).await {
                warn!("round request failed: {}", err);
            }
            self.phase = ParticipantPhase::Listening;
        }

        self.phase = ParticipantPhase::Stopped;
        info!(
            "stopped after {} trainings",
            self.history.total_trainings()
        );
    }

    /// Answer the round request received on the given connection.
    ///
    /// Requests for actions other than [`Action::Train`] are left
    /// unanswered.
    pub async fn handle_connection<S>(&mut self, mut stream: S) -> Result<(), ParticipantError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request_timeout = self.settings.request_timeout();
        let request: RoundRequest = timeout(request_timeout, channel::receive(&mut stream))
            .await
            .map_err(|_| ParticipantError::Timeout(request_timeout))??;

        if let Action::Other(ref action) = request.action {
            debug!("ignoring action {} of round {}", action, request.round);
            return Ok(());
        }
        request.state.validate()?;

        let round = request.round;
        self.phase = ParticipantPhase::Training(round);
        info!("training for round {}", round);
        let update = self.compute.compute(&request).await?;

        self.history.record(TrainingRecord {
            round,
            loss: update.loss,
            accuracy: update.accuracy,
        });
        if let Some(best) = self.history.best() {
            info!(
                "round {} trained: loss {:.4}, accuracy {:.4} (best {:.4} in round {})",
                round, update.loss, update.accuracy, best.accuracy, best.round
            );
        }

        let result = RoundResult {
            round,
            sample_count: self.sample_count,
            loss: update.loss,
            accuracy: update.accuracy,
            state: update.state,
        };
        timeout(request_timeout, channel::send(&mut stream, &result))
            .await
            .map_err(|_| ParticipantError::Timeout(request_timeout))??;
        Ok(())
    }
}
