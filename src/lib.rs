#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod kv;
pub mod raft;
pub mod server;

pub use client::Client;
pub use error::{Error, Result};
pub use server::Server;
