#![deny(warnings)]

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod hash;
pub mod listener;
pub mod master;
pub mod node;
pub mod ring;
pub mod shutdown;
pub mod store;
pub mod wire;

pub use client::Client;
pub use config::{Configuration, Role};
pub use error::Error;
pub use hash::loop_hash;
pub use node::{Node, NodeStatus};
pub use ring::Ring;
