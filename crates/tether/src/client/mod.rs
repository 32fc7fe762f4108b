//! Client side: the call arena, its dispatch worker and [`Channel`].

mod channel;
mod endpoint;
mod marshaller;

pub use channel::Channel;
