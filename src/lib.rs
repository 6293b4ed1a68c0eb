pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
mod pipeline;
pub mod pubsub;
pub mod reconnect;
mod transaction;
pub mod transport;

pub use client::Client;
pub use command::{Command, ToArg};
pub use config::Config;
pub use connection::{Connection, ConnectionState};
pub use error::Error;
pub use frame::Frame;
pub use pipeline::ResponseFuture;
pub use pubsub::{Message, Subscription};

pub type Result<T> = std::result::Result<T, Error>;
