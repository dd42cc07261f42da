//! # FedRoute: round coordination for federated training
//!
//! This crate implements the coordination protocol between a federated
//! learning coordinator and the participants (vehicles) that train locally
//! on their own data.
//!
//! - Participants register with the coordinator on a rendez-vous port,
//!   declaring their identity, how many samples they hold and the port they
//!   listen on for training requests. See [`coordinator::registration`].
//! - Each round, the coordinator selects a subset of the registered
//!   participants, opens one connection per participant and sends it a
//!   training request. See [`coordinator::Coordinator`].
//! - Participants run the training locally and answer with their loss,
//!   accuracy and model state. See [`participant::Participant`].
//! - The coordinator aggregates the answers into round metrics and, when
//!   participants return model parameters, into a new global model state
//!   weighted by each participant's sample count. See
//!   [`coordinator::aggregation`].
//!
//! All the messages are exchanged over plain TCP, framed with a 4 bytes
//! big-endian length prefix. See [`channel`].

#[macro_use]
extern crate async_trait;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate tracing;

pub mod channel;
pub mod coordinator;
pub mod message;
pub mod participant;
pub mod settings;
pub mod utils;
