pub mod client;
pub mod cluster;
pub mod codec;
pub mod command;
pub mod commands;
pub mod config;
mod connection;
pub mod frame;
mod pairing;
pub mod pubsub;
pub mod reply;
pub mod transaction;

pub use client::Client;
pub use command::{cmd, Arg, Charset, Command, FromFrame};
pub use config::Config;
pub use frame::Frame;
pub use pubsub::{Listener, ListenerHandle, Message};
pub use reply::{CommandError, Reply, ServerError};
pub use transaction::Transaction;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
