//! Push channel for newly stored messages.
//!
//! [`dispatcher::Dispatcher`] fans events out to every WebSocket connection;
//! each connection forwards only the conversations it subscribed to.

pub mod auth;
pub mod connection;
pub mod dispatcher;
