#![doc = include_str!("../README.md")]

mod args;
mod codec;
mod error;
mod interface;
mod metrics;

pub mod security;
pub mod transport;
pub mod wire;

pub use args::*;
pub use codec::*;
pub use error::*;
pub use interface::*;
pub use metrics::*;

pub use security::{NullSecurityHandler, Principal, SecurityHandler};
pub use transport::{Frame, Socket, SocketFactory, TransportError};
