//! Delivery of round requests to the selected participants.

use std::{io, net::SocketAddr, time::Duration};

use futures::future::join_all;
use thiserror::Error;
use tokio::{net::TcpStream, time::timeout};
use tracing_futures::Instrument;

use crate::{
    channel::{self, ChannelError},
    coordinator::directory::ClientRecord,
    message::{ClientId, ModelStateError, RoundRequest, RoundResult},
};

#[derive(Debug, Error)]
/// Errors that exclude a participant from a round.
pub enum DispatchError {
    #[error("no result after {0:?}")]
    Timeout(Duration),
    #[error("failed to connect to {0}: {1}")]
    Connect(SocketAddr, #[source] io::Error),
    #[error("exchange failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("invalid model state: {0}")]
    InvalidState(#[from] ModelStateError),
}

/// Sends round requests over fresh connections and collects the results.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher bounding every exchange by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run one exchange with the given participant.
    ///
    /// The connection, the request and the result together must complete
    /// within the dispatcher's timeout.
    pub async fn dispatch(
        &self,
        client: &ClientRecord,
        request: &RoundRequest,
    ) -> Result<RoundResult, DispatchError> {
        let result = timeout(self.timeout, exchange(client.address, request))
            .await
            .map_err(|_| DispatchError::Timeout(self.timeout))??;
        result.state.validate()?;
        Ok(result)
    }

    /// Run the exchanges with all the given participants concurrently.
    ///
    /// # Returns
    /// One outcome per participant, in the order of `clients`.
    pub async fn dispatch_all(
        &self,
        clients: &[ClientRecord],
        request: &RoundRequest,
    ) -> Vec<(ClientId, Result<RoundResult, DispatchError>)> {
        let exchanges = clients.iter().map(|client| {
            let span = debug_span!("dispatch", client = %client.id, round = request.round);
            async move { (client.id.clone(), self.dispatch(client, request).await) }
                .instrument(span)
        });
        join_all(exchanges).await
    }
}

async fn exchange(
    address: SocketAddr,
    request: &RoundRequest,
) -> Result<RoundResult, DispatchError> {
    let mut stream = TcpStream::connect(address)
        .await
        .map_err(|err| DispatchError::Connect(address, err))?;
    channel::send(&mut stream, request).await?;
    let result = channel::receive(&mut stream).await?;
    Ok(result)
}
