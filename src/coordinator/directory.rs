//! The store for all the clients the coordinator knows about.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::message::ClientId;

/// A registered client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRecord {
    pub id: ClientId,
    /// The address on which the client listens for round requests.
    pub address: SocketAddr,
    /// The number of samples the client declared. It is the client's
    /// weight during aggregation.
    pub sample_count: u64,
    /// Last time the client contacted the coordinator.
    pub last_seen: DateTime<Utc>,
}

impl ClientRecord {
    /// Create a new record, last seen now.
    pub fn new(id: ClientId, address: SocketAddr, sample_count: u64) -> Self {
        Self {
            id,
            address,
            sample_count,
            last_seen: Utc::now(),
        }
    }

    /// Whether the client hasn't been seen for more than `max_age`.
    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        // a negative age (clock going backward) means the record is fresh
        (now - self.last_seen)
            .to_std()
            .map(|age| age > max_age)
            .unwrap_or(false)
    }
}

/// The client directory, shared between the registration service and the
/// round coordinator.
///
/// Records are only ever accessed through the lock: readers get copies via
/// [`ClientDirectory::snapshot`], and never iterate over the live map.
#[derive(Debug, Clone, Default)]
pub struct ClientDirectory {
    clients: Arc<RwLock<HashMap<ClientId, ClientRecord>>>,
}

impl ClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the given record, overwriting any record with the same id.
    ///
    /// # Returns
    /// The record that was replaced, if any.
    pub async fn upsert(&self, record: ClientRecord) -> Option<ClientRecord> {
        self.clients.write().await.insert(record.id.clone(), record)
    }

    pub async fn get(&self, id: &ClientId) -> Option<ClientRecord> {
        self.clients.read().await.get(id).cloned()
    }

    /// Return a copy of all the records, ordered by client id.
    pub async fn snapshot(&self) -> Vec<ClientRecord> {
        let mut records: Vec<ClientRecord> = self.clients.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Remove the clients that haven't been seen for more than `max_age`.
    ///
    /// # Returns
    /// The ids of the removed clients.
    pub async fn evict_stale(&self, max_age: Duration) -> Vec<ClientId> {
        let now = Utc::now();
        let mut clients = self.clients.write().await;
        let stale: Vec<ClientId> = clients
            .values()
            .filter(|record| record.is_stale(max_age, now))
            .map(|record| record.id.clone())
            .collect();
        for id in stale.iter() {
            clients.remove(id);
        }
        stale
    }
}
