//! Daemon mediating between user clients and the eBUS heating bus.
//!
//! One bus thread runs the [`bus_handler::BusHandler`] state machine
//! against the serial device; client threads interact through a
//! [`controller::BusController`] backed by the shared queues and tables of
//! [`bus_handler::BusShared`].

pub mod bus_handler;
pub mod config;
pub mod controller;
pub mod queue;
pub mod request;

pub use bus_handler::{BusHandler, BusShared, BusState};
pub use config::GatewayConfig;
pub use controller::BusController;
