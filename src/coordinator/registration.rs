//! The rendez-vous endpoint where participants register.

use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    time::timeout,
};
use tracing_futures::Instrument;

use crate::{
    channel::{self, ChannelError},
    coordinator::directory::{ClientDirectory, ClientRecord},
    message::{ClientId, RegistrationReply, RegistrationRequest},
    settings::CoordinatorSettings,
    utils::{unix_time, Shutdown},
};

#[derive(Debug, Error)]
/// Errors of the registration service.
pub enum RegistrationError {
    #[error("failed to bind the rendez-vous address: {0}")]
    Bind(#[source] io::Error),
    #[error("registration exchange failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("registration exchange timed out after {0:?}")]
    Timeout(Duration),
    #[error("client {0} announced an invalid callback port")]
    InvalidCallbackPort(ClientId),
}

/// Accepts registrations and records them in the [`ClientDirectory`].
pub struct RegistrationService {
    listener: TcpListener,
    directory: ClientDirectory,
    accept_timeout: Duration,
    request_timeout: Duration,
    shutdown: Shutdown,
}

impl RegistrationService {
    /// Bind the rendez-vous address.
    ///
    /// # Errors
    /// Fails if the address cannot be bound. This is fatal for the
    /// coordinator.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        directory: ClientDirectory,
        settings: &CoordinatorSettings,
        shutdown: Shutdown,
    ) -> Result<Self, RegistrationError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(RegistrationError::Bind)?;
        Ok(Self {
            listener,
            directory,
            accept_timeout: settings.accept_timeout(),
            request_timeout: settings.request_timeout(),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept registrations until the shutdown flag is raised.
    ///
    /// Every registration is handled on its own task, so a slow client
    /// cannot hold the endpoint.
    pub async fn run(self) {
        match self.local_addr() {
            Ok(addr) => info!("registration service listening on {}", addr),
            Err(_) => info!("registration service listening"),
        }

        while !self.shutdown.is_triggered() {
            let (stream, peer) = match timeout(self.accept_timeout, self.listener.accept()).await {
                Err(_) => continue,
                Ok(Err(err)) => {
                    warn!("failed to accept a connection: {}", err);
                    continue;
                }
                Ok(Ok(accepted)) => accepted,
            };

            let directory = self.directory.clone();
            let request_timeout = self.request_timeout;
            tokio::spawn(
                async move {
                    if let Err(err) =
                        handle_registration(stream, peer, directory, request_timeout).await
                    {
                        warn!("registration failed: {}", err);
                    }
                }
                .instrument(error_span!("registration", peer = %peer)),
            );
        }

        info!("registration service stopped");
    }
}

async fn handle_registration(
    mut stream: TcpStream,
    peer: SocketAddr,
    directory: ClientDirectory,
    request_timeout: Duration,
) -> Result<(), RegistrationError> {
    let request: RegistrationRequest = timeout(request_timeout, channel::receive(&mut stream))
        .await
        .map_err(|_| RegistrationError::Timeout(request_timeout))??;

    if request.callback_port == 0 {
        let rejected = RegistrationReply::rejected(unix_time());
        reply(&mut stream, rejected, request_timeout).await?;
        return Err(RegistrationError::InvalidCallbackPort(request.identity));
    }

    let record = ClientRecord::new(
        request.identity,
        SocketAddr::new(peer.ip(), request.callback_port),
        request.sample_count,
    );
    info!(
        "client {} registered with {} samples, listening on {}",
        record.id, record.sample_count, record.address
    );
    if let Some(previous) = directory.upsert(record).await {
        debug!("client {} registered again, record replaced", previous.id);
    }

    let connected = RegistrationReply::connected(unix_time());
    reply(&mut stream, connected, request_timeout).await
}

async fn reply(
    stream: &mut TcpStream,
    reply: RegistrationReply,
    request_timeout: Duration,
) -> Result<(), RegistrationError> {
    timeout(request_timeout, channel::send(stream, &reply))
        .await
        .map_err(|_| RegistrationError::Timeout(request_timeout))??;
    Ok(())
}
