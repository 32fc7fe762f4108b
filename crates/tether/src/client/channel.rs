use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tether_core::{
    Args, Codec, EndpointMetricsSnapshot, Interface, NullSecurityHandler, PostcardCodec, Returns,
    RpcError, SecurityHandler, SocketFactory,
};

use super::endpoint::ClientEndpoint;
use super::marshaller::ClientMarshaller;
use crate::endpoint::{EndpointCrashed, EndpointState};
use crate::options::ChannelOptions;

/// A client connection to one server address.
///
/// Any number of threads may invoke methods concurrently; at most
/// [`ChannelOptions::arena_capacity`] calls are in flight at once and further
/// calls fail fast with `Unavailable`. Replies are matched to calls by id, so
/// they may complete in any order.
///
/// ```rust
/// use std::sync::Arc;
/// use tether::prelude::*;
/// use tether::transport::MemHub;
///
/// let hub = Arc::new(MemHub::new());
/// let greeter = Interface::new("demo.Greeter").method("greet", 1, Returns::Value);
///
/// let server: Server = Server::bind("inproc://greeter", hub.clone());
/// server
///     .register(ServiceBinding::new(greeter.clone()).bind("greet", |params: &Params| {
///         let name: String = params.get(0)?;
///         Ok(format!("hello, {name}"))
///     }))
///     .unwrap();
/// server.start().unwrap();
///
/// let channel: Channel = Channel::connect("inproc://greeter", hub).unwrap();
/// let args = channel.args().arg(&"tether").unwrap();
/// let reply: Option<String> = channel.invoke(&greeter, "greet", args).unwrap();
/// assert_eq!(reply.as_deref(), Some("hello, tether"));
/// ```
pub struct Channel<C: Codec = PostcardCodec> {
    endpoint: ClientEndpoint,
    marshaller: ClientMarshaller<C>,
    call_timeout: Duration,
}

impl<C: Codec> Channel<C> {
    /// Connect to `address` and start the dispatch worker.
    pub fn open(
        address: &str,
        factory: Arc<dyn SocketFactory>,
        security: Arc<dyn SecurityHandler>,
        options: ChannelOptions,
    ) -> Result<Self, RpcError> {
        let call_timeout = options.call_timeout;
        Ok(Channel {
            endpoint: ClientEndpoint::start(address, factory, options)?,
            marshaller: ClientMarshaller::new(security),
            call_timeout,
        })
    }

    /// [`Channel::open`] with no security and default options.
    pub fn connect(address: &str, factory: Arc<dyn SocketFactory>) -> Result<Self, RpcError> {
        Self::open(
            address,
            factory,
            Arc::new(NullSecurityHandler),
            ChannelOptions::default(),
        )
    }

    /// An empty argument list for this channel's codec.
    pub fn args(&self) -> Args<C> {
        Args::new()
    }

    /// Invoke a value-returning method. `Ok(None)` is a null reply.
    pub fn invoke<R: DeserializeOwned>(
        &self,
        interface: &Interface,
        method: &str,
        args: Args<C>,
    ) -> Result<Option<R>, RpcError> {
        self.invoke_with_timeout(interface, method, args, self.call_timeout)
    }

    pub fn invoke_with_timeout<R: DeserializeOwned>(
        &self,
        interface: &Interface,
        method: &str,
        args: Args<C>,
        timeout: Duration,
    ) -> Result<Option<R>, RpcError> {
        let payload = self
            .marshaller
            .marshal_call(interface, method, Returns::Value, args)?;
        let reply = self.endpoint.call(payload, timeout)?;
        self.marshaller.unmarshal_reply(Returns::Value, &reply)
    }

    pub fn invoke_void(
        &self,
        interface: &Interface,
        method: &str,
        args: Args<C>,
    ) -> Result<(), RpcError> {
        self.invoke_void_with_timeout(interface, method, args, self.call_timeout)
    }

    pub fn invoke_void_with_timeout(
        &self,
        interface: &Interface,
        method: &str,
        args: Args<C>,
        timeout: Duration,
    ) -> Result<(), RpcError> {
        let payload = self
            .marshaller
            .marshal_call(interface, method, Returns::Void, args)?;
        let reply = self.endpoint.call(payload, timeout)?;
        self.marshaller
            .unmarshal_reply::<()>(Returns::Void, &reply)
            .map(|_| ())
    }

    pub fn address(&self) -> &str {
        self.endpoint.address()
    }

    pub fn state(&self) -> EndpointState {
        self.endpoint.state()
    }

    pub fn metrics(&self) -> EndpointMetricsSnapshot {
        self.endpoint.metrics().snapshot()
    }

    /// Run `hook` if the connection fails.
    pub fn on_crashed(&self, hook: impl Fn(&EndpointCrashed) + Send + Sync + 'static) {
        self.endpoint.lifecycle().on_crashed(Box::new(hook));
    }

    /// Wait for in-flight calls, abort the rest and disconnect. Idempotent.
    pub fn close(&self) {
        self.endpoint.shutdown();
    }
}

impl<C: Codec> Drop for Channel<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: Codec> std::fmt::Debug for Channel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.address())
            .field("state", &self.state())
            .field("encoding", &C::ENCODING)
            .finish()
    }
}
