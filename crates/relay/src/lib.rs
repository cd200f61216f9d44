//! Durable MCP session engine.
//!
//! One [`client::ConnectionClient`] drives a single authenticated connection
//! to a remote MCP server through its lifecycle (OAuth, tool discovery,
//! steady state), persisting every transition to a pluggable
//! [`store::SessionStore`] so any process can reconstruct the connection from
//! the stored record. A [`aggregator::SessionAggregator`] fans operations out
//! across every session owned by one identity, and an [`events::EventBus`]
//! pushes lifecycle events to subscribed observers without blocking the
//! state machine.

pub mod aggregator;
pub mod client;
pub mod credentials;
pub mod error;
pub mod events;
pub mod oauth;
pub mod session;
pub mod store;
pub mod transport;
