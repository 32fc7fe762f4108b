#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod client;
pub mod endpoint;
pub mod options;
pub mod server;

pub use client::Channel;
pub use endpoint::{EndpointCrashed, EndpointState};
pub use options::{ChannelOptions, ServerOptions};
pub use server::{Server, ServiceBinding};

// Re-export core types
pub use tether_core::{
    // Arguments
    Args,
    BoxError,
    // Codecs
    Codec,
    EndpointMetricsSnapshot,
    Encoding,
    // Error types
    ErrorCode,
    // Interfaces
    Interface,
    InterfaceError,
    JsonCodec,
    MethodSig,
    MethodTable,
    Params,
    PostcardCodec,
    Returns,
    RpcError,
};

pub use tether_core::security;

/// Prelude module for convenient imports.
///
/// ```
/// use tether::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Args, BoxError, Channel, ChannelOptions, ErrorCode, Interface, Params, Returns, RpcError,
        Server, ServerOptions, ServiceBinding,
    };
}

/// Frame transports.
///
/// [`MemHub`](transport::MemHub) connects clients and servers inside one
/// process; other transports implement [`SocketFactory`](transport::SocketFactory).
pub mod transport {
    pub use tether_core::transport::*;
}
