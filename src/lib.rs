//! `relaymail`: store-and-forward email for sites with intermittent
//! connectivity.
//!
//! On the client, [`connection::ConnectionManager`] brings up a modem link and
//! [`sync::SyncEngine`] moves pending outbound mail and new inbound mail across
//! it. On the server, [`queue::QueueConsumer`] drains inbound resource ids
//! through [`ingest::InboundIngestionJob`].

pub mod config;
pub mod connection;
pub mod error;
pub mod ingest;
pub mod model;
pub mod parser;
pub mod queue;
pub mod store;
pub mod sync;
