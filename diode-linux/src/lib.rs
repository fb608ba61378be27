//! Diode edge client host: config loading and the async connection driver.

pub mod config;
pub mod connection;

pub use connection::{spawn, ClientError, Connection, EdgeClient};
