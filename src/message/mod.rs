//! Messages exchanged between the coordinator and the participants.
//!
//! There are two exchanges, each one made of a request and a response sent
//! over a fresh connection:
//!
//! - registration: the participant sends a [`RegistrationRequest`] to the
//!   coordinator's rendez-vous address and gets a [`RegistrationReply`] back.
//! - training: the coordinator sends a [`RoundRequest`] to the participant's
//!   callback address and gets a [`RoundResult`] back.
//!
//! The framing of these messages on the wire is handled by [`crate::channel`].

pub mod model;

use std::fmt;

use derive_more::{Display, From};

pub use self::model::{ModelState, ModelStateError, Parameter, ParameterKind, MODEL_STATE_VERSION};

#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Clone, Display, From, Serialize, Deserialize)]
/// A unique client identifier, chosen by the participant itself (_e.g._
/// `vehicle_03`).
pub struct ClientId(String);

impl ClientId {
    /// Return a new client identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the number following the last `_` of the identifier, if any.
    ///
    /// ```rust
    /// # use fedroute::message::ClientId;
    /// assert_eq!(ClientId::new("vehicle_07").index(), Some(7));
    /// assert_eq!(ClientId::new("vehicle").index(), None);
    /// ```
    pub fn index(&self) -> Option<u16> {
        self.0
            .rsplit_once('_')
            .and_then(|(_, suffix)| suffix.parse().ok())
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Registration request, sent by a participant to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// The identity of the participant.
    pub identity: ClientId,
    /// The number of local training samples. It is used as the weight of
    /// the participant during aggregation.
    pub sample_count: u64,
    /// The port on which the participant listens for round requests.
    pub callback_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    /// The participant has been recorded and may be selected for training.
    #[display(fmt = "connected")]
    Connected,
    /// The registration was refused, _e.g._ because the callback port is
    /// not usable.
    #[display(fmt = "rejected")]
    Rejected,
}

/// Response to a [`RegistrationRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationReply {
    pub status: RegistrationStatus,
    /// The coordinator's clock, in seconds since the Unix epoch.
    pub server_time: f64,
}

impl RegistrationReply {
    pub fn connected(server_time: f64) -> Self {
        Self {
            status: RegistrationStatus::Connected,
            server_time,
        }
    }

    pub fn rejected(server_time: f64) -> Self {
        Self {
            status: RegistrationStatus::Rejected,
            server_time,
        }
    }
}

/// The action a [`RoundRequest`] asks the participant to perform.
///
/// On the wire, the action is a plain string so that participants can
/// decode requests for actions they don't know about and ignore them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    /// Train the model on the local data.
    Train,
    /// Any action this version of the protocol doesn't know about.
    Other(String),
}

impl From<String> for Action {
    fn from(action: String) -> Self {
        match action.as_str() {
            "train" => Self::Train,
            _ => Self::Other(action),
        }
    }
}

impl From<&str> for Action {
    fn from(action: &str) -> Self {
        Self::from(action.to_string())
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Train => "train".to_string(),
            Action::Other(action) => action,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Train => write!(f, "train"),
            Action::Other(action) => write!(f, "{}", action),
        }
    }
}

/// A request sent by the coordinator to a selected participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRequest {
    pub action: Action,
    /// The round number, assigned by the coordinator.
    pub round: u64,
    /// The current global model state. It is empty when the coordinator
    /// doesn't track any model.
    pub state: ModelState,
}

impl RoundRequest {
    /// Create a training request for the given round.
    pub fn train(round: u64, state: ModelState) -> Self {
        Self {
            action: Action::Train,
            round,
            state,
        }
    }
}

/// The result of a round, sent back by a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundResult {
    /// The round number of the request this result answers.
    pub round: u64,
    /// The number of samples the participant trained on.
    pub sample_count: u64,
    pub loss: f64,
    pub accuracy: f64,
    /// The participant's model state after training. It may be empty.
    pub state: ModelState,
}

impl RoundResult {
    /// Whether both the loss and the accuracy are finite numbers.
    pub fn has_finite_metrics(&self) -> bool {
        self.loss.is_finite() && self.accuracy.is_finite()
    }
}
