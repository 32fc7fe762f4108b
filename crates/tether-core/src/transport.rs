//! Frame socket traits.
//!
//! Endpoints talk to a message transport through [`Socket`], created by a
//! [`SocketFactory`] the caller passes in. A message is a run of frames; every
//! frame but the last is sent with `more = true`. Sockets follow the router /
//! dealer pattern: a bound (router) socket prefixes each received message with
//! the sender's identity frame and routes each sent message by its first
//! frame, so a server answers the right client without tracking connections.

use std::fmt;

use bytes::Bytes;

pub mod fault;
pub mod mem;

pub use fault::{FaultAction, FaultInjector};
pub use mem::{DEFAULT_HIGH_WATER_MARK, MemHub};

pub type Frame = Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    InvalidAddress(String),
    AddressInUse(String),
    ConnectionRefused(String),
    /// The peer or the socket itself has gone away.
    Closed,
    /// The peer's inbox is at its high-water mark.
    Full,
    /// A message ended before its last frame.
    Truncated,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidAddress(addr) => write!(f, "invalid address: {addr}"),
            TransportError::AddressInUse(addr) => write!(f, "address already in use: {addr}"),
            TransportError::ConnectionRefused(addr) => {
                write!(f, "connection refused: nothing is bound at {addr}")
            }
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Full => write!(f, "transport high-water mark reached"),
            TransportError::Truncated => write!(f, "message ended before its last frame"),
        }
    }
}

impl std::error::Error for TransportError {}

/// One end of a frame transport. Never blocks.
pub trait Socket: Send {
    /// Queue one frame. The message is delivered once a frame is sent with
    /// `more == false`.
    fn send(&mut self, frame: Frame, more: bool) -> Result<(), TransportError>;

    /// Next frame of the current message and whether more frames follow.
    fn try_recv(&mut self) -> Result<Option<(Frame, bool)>, TransportError>;

    fn has_incoming(&self) -> bool;

    fn has_outgoing_capacity(&self) -> bool;

    fn send_message(&mut self, frames: &[Frame]) -> Result<(), TransportError> {
        let last = frames.len().saturating_sub(1);
        for (i, frame) in frames.iter().enumerate() {
            self.send(frame.clone(), i < last)?;
        }
        Ok(())
    }

    /// Receive a whole message if one is available.
    fn recv_message(&mut self) -> Result<Option<Vec<Frame>>, TransportError> {
        let Some((frame, mut more)) = self.try_recv()? else {
            return Ok(None);
        };
        let mut frames = vec![frame];
        while more {
            let (frame, next) = self.try_recv()?.ok_or(TransportError::Truncated)?;
            frames.push(frame);
            more = next;
        }
        Ok(Some(frames))
    }
}

pub trait SocketFactory: Send + Sync + 'static {
    /// Connect a dealer socket to a bound router.
    fn connect(&self, address: &str) -> Result<Box<dyn Socket>, TransportError>;

    /// Bind a router socket.
    fn bind(&self, address: &str) -> Result<Box<dyn Socket>, TransportError>;
}
