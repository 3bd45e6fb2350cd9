pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod relay;
pub mod signal;
pub mod stream;
pub mod telemetry;

pub use config::TunnelConfig;
pub use connection::{
    ConnectError, Connection, ConnectionListener, EstablishmentState, connect, listen,
};
pub use stream::{ChannelStream, StreamError};
