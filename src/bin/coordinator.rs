use std::{path::PathBuf, process};

use anyhow::Context;
use structopt::StructOpt;
use tokio::signal;
use tracing_subscriber::FmtSubscriber;
use validator::Validate;

use fedroute::{
    coordinator::{ClientDirectory, Coordinator, RandomSelector, RegistrationService},
    settings::Settings,
    utils::Shutdown,
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, long = "config", parse(from_os_str))]
    config_path: Option<PathBuf>,

    /// Host of the rendez-vous endpoint
    #[structopt(long)]
    host: Option<String>,

    /// Port of the rendez-vous endpoint
    #[structopt(long)]
    port: Option<u16>,

    /// Number of training rounds
    #[structopt(long)]
    rounds: Option<u64>,

    /// Number of participants selected in each round
    #[structopt(long)]
    clients_per_round: Option<usize>,

    /// Start training without waiting for clients to register
    #[structopt(long)]
    force: bool,
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
        if let Some(rounds) = self.rounds {
            settings.coordinator.rounds = rounds;
        }
        if let Some(clients_per_round) = self.clients_per_round {
            settings.coordinator.clients_per_round = clients_per_round;
        }

        if let Err(err) = settings.validate() {
            eprintln!("{}", err);
            process::exit(1);
        }
        settings
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    let Settings {
        api: api_settings,
        coordinator: coordinator_settings,
        log: log_settings,
        ..
    } = opt.settings();

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let shutdown = Shutdown::new();
    let directory = ClientDirectory::new();
    let registration = RegistrationService::bind(
        api_settings.address(),
        directory.clone(),
        &coordinator_settings,
        shutdown.clone(),
    )
    .await
    .with_context(|| format!("failed to listen on {}", api_settings.address()))?;
    let registration_handle = tokio::spawn(registration.run());

    let rounds = coordinator_settings.rounds;
    let clients_per_round = coordinator_settings.clients_per_round;
    info!(
        "training {} rounds with {} clients per round",
        rounds, clients_per_round
    );
    let mut coordinator = Coordinator::new(
        directory,
        RandomSelector::new(),
        coordinator_settings,
        shutdown.clone(),
    );

    tokio::select! {
        history = async {
            coordinator.await_clients(opt.force).await;
            coordinator.run(rounds, clients_per_round).await
        } => {
            for metrics in history.iter() {
                info!(
                    "round {}: {}/{} responded, weighted accuracy {:.4}, weighted loss {:.4}",
                    metrics.round,
                    metrics.responded,
                    metrics.selected,
                    metrics.weighted_accuracy,
                    metrics.weighted_loss,
                );
            }
        }
        _ = signal::ctrl_c() => {
            warn!("shutting down: interrupted");
        }
    }

    shutdown.trigger();
    registration_handle
        .await
        .context("registration service panicked")?;
    Ok(())
}
