use std::{path::PathBuf, process};

use structopt::StructOpt;
use tokio::signal;
use tracing_subscriber::FmtSubscriber;
use validator::Validate;

use fedroute::{
    message::ClientId,
    participant::{Participant, SimulatedTraining},
    settings::Settings,
    utils::Shutdown,
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Participant")]
struct Opt {
    /// Identity of the participant, e.g. `vehicle_03`
    #[structopt(long)]
    id: String,

    /// Path of the configuration file
    #[structopt(short, long = "config", parse(from_os_str))]
    config_path: Option<PathBuf>,

    /// Host of the coordinator
    #[structopt(long)]
    host: Option<String>,

    /// Port of the coordinator
    #[structopt(long)]
    port: Option<u16>,

    /// Number of local samples
    #[structopt(long)]
    samples: Option<u64>,

    /// Port on which round requests are received
    #[structopt(long)]
    callback_port: Option<u16>,
}

impl Opt {
    fn settings(&self) -> Settings {
        let loaded = match self.config_path {
            Some(ref path) => Settings::new(path),
            None => Settings::from_env(),
        };
        let mut settings = loaded.unwrap_or_else(|err| {
            eprintln!("{}", err);
            process::exit(1);
        });

        if let Some(ref host) = self.host {
            settings.api.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.api.port = port;
        }
        if self.samples.is_some() {
            settings.participant.sample_count = self.samples;
        }
        if self.callback_port.is_some() {
            settings.participant.callback_port = self.callback_port;
        }

        if let Err(err) = settings.validate() {
            eprintln!("{}", err);
            process::exit(1);
        }
        settings
    }
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    let Settings {
        api: api_settings,
        participant: participant_settings,
        log: log_settings,
        ..
    } = opt.settings();

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let shutdown = Shutdown::new();
    let training = SimulatedTraining::new(participant_settings.training_delay());
    let mut participant = Participant::new(
        ClientId::new(opt.id),
        &api_settings,
        participant_settings,
        training,
        shutdown.clone(),
    );

    tokio::select! {
        result = participant.run() => {
            if let Err(err) = result {
                error!("{}", err);
                process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            warn!("shutting down: interrupted");
            shutdown.trigger();
        }
    }
}
