//! Server side of the burrow reverse-tunneling service.
//!
//! Clients behind NAT log in over a framed message stream; the server
//! publishes their private services on its public network, pairing each
//! external user connection with a work connection tunneled back to the
//! owning client.

pub mod config;
pub mod control;
pub mod dashboard;
pub mod error;
pub mod group;
pub mod metrics;
pub mod nathole;
pub mod net;
pub mod plugin;
pub mod ports;
pub mod proxy;
pub mod service;
pub mod ssh;
pub mod transport;
pub mod util;
pub mod vhost;
pub mod visitor;
