//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables, _e.g._
//! `FEDROUTE__COORDINATOR__ROUNDS=10`. An example configuration file can be found in the
//! `configs/` directory located in the repository root. Every setting has a default value, so
//! sections can be omitted from the configuration file. Without a configuration file, the
//! environment variables are applied on top of the default values.
//!
//! All the durations are expressed in seconds and are limited to one year.

use std::{fmt, path::Path, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::de::{self, Deserializer, Visitor};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Default, Validate, Deserialize)]
#[serde(default)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub api: ApiSettings,
    #[validate]
    pub coordinator: CoordinatorSettings,
    #[validate]
    pub participant: ParticipantSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(Some(path.as_ref()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads and validates the settings from the environment only, on top
    /// of the default values.
    ///
    /// # Errors
    /// Fails when an environment variable can't be parsed or the validation failed.
    pub fn from_env() -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(None)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(Environment::with_prefix("fedroute").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[serde(default)]
/// Address of the coordinator's rendez-vous endpoint.
pub struct ApiSettings {
    /// The host the coordinator binds to, and the participants connect to.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// host = "localhost"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUTE__API__HOST=localhost
    /// ```
    #[validate(length(min = 1))]
    pub host: String,

    /// The rendez-vous port.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// port = 8080
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUTE__API__PORT=8080
    /// ```
    pub port: u16,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
        }
    }
}

impl ApiSettings {
    /// The rendez-vous address, as `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[validate(schema(function = "validate_coordinator"))]
#[serde(default)]
/// Round coordination settings.
pub struct CoordinatorSettings {
    /// The number of training rounds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [coordinator]
    /// rounds = 6
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUTE__COORDINATOR__ROUNDS=6
    /// ```
    pub rounds: u64,

    /// The number of participants selected in each round. If fewer clients are registered, all
    /// of them are selected. The value must be at least `1`.
    #[validate(range(min = 1))]
    pub clients_per_round: usize,

    /// How long to wait for clients to register before the first round.
    pub warmup: f64,

    /// Pause between two rounds.
    pub round_pause: f64,

    /// Bound on a single `accept` of the rendez-vous endpoint. The shutdown flag is checked
    /// every time it elapses.
    pub accept_timeout: f64,

    /// Bound on the whole exchange with one participant during a round (connection, request
    /// and result). A participant that doesn't answer in time is excluded from the round.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [coordinator]
    /// dispatch_timeout = 15.0
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUTE__COORDINATOR__DISPATCH_TIMEOUT=15.0
    /// ```
    pub dispatch_timeout: f64,

    /// Bound on reading a registration request and writing its reply.
    pub request_timeout: f64,

    /// Whether results that don't carry the round number of the request they answer are
    /// rejected.
    pub enforce_round_match: bool,

    /// If set, clients that haven't registered for longer than this are evicted before
    /// participants are selected. Unset by default: clients are never evicted.
    pub stale_after: Option<f64>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            rounds: 6,
            clients_per_round: 4,
            warmup: 15.0,
            round_pause: 2.5,
            accept_timeout: 1.0,
            dispatch_timeout: 15.0,
            request_timeout: 5.0,
            enforce_round_match: true,
            stale_after: None,
        }
    }
}

impl CoordinatorSettings {
    pub fn warmup(&self) -> Duration {
        Duration::from_secs_f64(self.warmup)
    }

    pub fn round_pause(&self) -> Duration {
        Duration::from_secs_f64(self.round_pause)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.accept_timeout)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.dispatch_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout)
    }

    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after.map(Duration::from_secs_f64)
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[validate(schema(function = "validate_participant"))]
#[serde(default)]
/// Participant settings.
pub struct ParticipantSettings {
    /// The host the participant binds its callback listener to.
    #[validate(length(min = 1))]
    pub listen_host: String,

    /// The number of registration attempts before giving up. The value must be at least `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [participant]
    /// registration_attempts = 5
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUTE__PARTICIPANT__REGISTRATION_ATTEMPTS=5
    /// ```
    #[validate(range(min = 1))]
    pub registration_attempts: u32,

    /// Pause between two registration attempts.
    pub registration_backoff: f64,

    /// Bound on a single registration attempt (connection, request and reply).
    pub registration_timeout: f64,

    /// Bound on a single `accept` of the callback listener. The shutdown flag is checked every
    /// time it elapses.
    pub idle_timeout: f64,

    /// Bound on reading a round request and on writing its result.
    pub request_timeout: f64,

    /// Duration of the simulated local training.
    pub training_delay: f64,

    /// The number of local samples. When unset, a random count in `50..200` is drawn.
    pub sample_count: Option<u64>,

    /// The callback port. When unset, it is derived from the participant id, see
    /// [`crate::participant::default_callback_port`].
    pub callback_port: Option<u16>,
}

impl Default for ParticipantSettings {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            registration_attempts: 5,
            registration_backoff: 2.0,
            registration_timeout: 5.0,
            idle_timeout: 60.0,
            request_timeout: 15.0,
            training_delay: 2.5,
            sample_count: None,
            callback_port: None,
        }
    }
}

impl ParticipantSettings {
    pub fn registration_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.registration_backoff)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.registration_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout)
    }

    pub fn training_delay(&self) -> Duration {
        Duration::from_secs_f64(self.training_delay)
    }
}

impl CoordinatorSettings {
    /// Checks the durations.
    fn validate_durations(&self) -> Result<(), ValidationError> {
        // the validate attribute doesn't support floats, therefore we check the durations here
        if is_non_negative(self.warmup)
            && is_non_negative(self.round_pause)
            && is_positive(self.accept_timeout)
            && is_positive(self.dispatch_timeout)
            && is_positive(self.request_timeout)
            && self.stale_after.map(is_positive).unwrap_or(true)
        {
            Ok(())
        } else {
            Err(ValidationError::new("invalid duration(s)"))
        }
    }
}

impl ParticipantSettings {
    /// Checks the durations.
    fn validate_durations(&self) -> Result<(), ValidationError> {
        if is_non_negative(self.registration_backoff)
            && is_positive(self.registration_timeout)
            && is_positive(self.idle_timeout)
            && is_positive(self.request_timeout)
            && is_non_negative(self.training_delay)
        {
            Ok(())
        } else {
            Err(ValidationError::new("invalid duration(s)"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_coordinator(s: &CoordinatorSettings) -> Result<(), ValidationError> {
    s.validate_durations()
}

/// A wrapper for validate derive.
fn validate_participant(s: &ParticipantSettings) -> Result<(), ValidationError> {
    s.validate_durations()
}

/// The longest accepted duration, one year.
const MAX_SECONDS: f64 = 365.0 * 24.0 * 3600.0;

fn is_positive(seconds: f64) -> bool {
    seconds > 0.0 && seconds <= MAX_SECONDS
}

fn is_non_negative(seconds: f64) -> bool {
    (0.0..=MAX_SECONDS).contains(&seconds)
}

#[derive(Debug, Deserialize)]
#[serde(default)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUTE__LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: EnvFilter::new("info"),
        }
    }
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
