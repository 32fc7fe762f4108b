//! Server side: the dispatch loop, its handler pool and [`Server`].

mod call;
mod endpoint;
mod executor;
mod handler;
mod marshaller;
mod queues;

use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::{
    Codec, EndpointMetrics, EndpointMetricsSnapshot, ErrorCode, NullSecurityHandler,
    PostcardCodec, RpcError, SecurityHandler, SocketFactory,
};

use self::endpoint::ServerEndpoint;
use self::executor::CallExecutor;
use self::marshaller::ServerMarshaller;
use crate::endpoint::{EndpointCrashed, EndpointState, Lifecycle};
use crate::options::ServerOptions;

pub use marshaller::ServiceBinding;

/// Serves registered services on one bound address.
///
/// Services may be registered before or after [`Server::start`]. Calls are
/// spread over [`ServerOptions::handler_count`] handler workers and each one
/// runs bounded by [`ServerOptions::call_timeout`].
pub struct Server<C: Codec = PostcardCodec> {
    factory: Arc<dyn SocketFactory>,
    options: ServerOptions,
    executor: Arc<CallExecutor<C>>,
    marshaller: Arc<ServerMarshaller<C>>,
    lifecycle: Arc<Lifecycle>,
    metrics: Arc<EndpointMetrics>,
    endpoint: Mutex<Option<ServerEndpoint>>,
}

impl<C: Codec> Server<C> {
    pub fn new(
        address: &str,
        factory: Arc<dyn SocketFactory>,
        security: Arc<dyn SecurityHandler>,
        options: ServerOptions,
    ) -> Self {
        let marshaller = Arc::new(ServerMarshaller::new(security));
        Server {
            factory,
            options,
            executor: Arc::new(CallExecutor::new(marshaller.clone())),
            marshaller,
            lifecycle: Arc::new(Lifecycle::new(address)),
            metrics: Arc::new(EndpointMetrics::new()),
            endpoint: Mutex::new(None),
        }
    }

    /// [`Server::new`] with no security and default options.
    pub fn bind(address: &str, factory: Arc<dyn SocketFactory>) -> Self {
        Self::new(
            address,
            factory,
            Arc::new(NullSecurityHandler),
            ServerOptions::default(),
        )
    }

    /// Make a service callable.
    ///
    /// Fails if the interface cannot be served (overloaded or over-long
    /// method signatures), if the binding does not implement exactly the
    /// interface's methods, or if a service of that name is already
    /// registered.
    pub fn register(&self, binding: ServiceBinding<C>) -> Result<(), RpcError> {
        self.marshaller.register(binding)
    }

    /// Run `hook` if the endpoint fails.
    pub fn on_crashed(&self, hook: impl Fn(&EndpointCrashed) + Send + Sync + 'static) {
        self.lifecycle.on_crashed(Box::new(hook));
    }

    /// Bind the address and start serving. A server starts at most once.
    pub fn start(&self) -> Result<(), RpcError> {
        let mut endpoint = self.endpoint.lock();
        if endpoint.is_some() || self.lifecycle.state() != EndpointState::Created {
            return Err(RpcError::new(
                ErrorCode::AlreadyExists,
                format!("Server {} has already been started.", self.address()),
            ));
        }
        *endpoint = Some(ServerEndpoint::start(
            self.factory.clone(),
            self.executor.clone(),
            self.lifecycle.clone(),
            self.metrics.clone(),
            self.options.clone(),
        )?);
        Ok(())
    }

    pub fn address(&self) -> &str {
        self.lifecycle.address()
    }

    pub fn state(&self) -> EndpointState {
        self.lifecycle.state()
    }

    pub fn metrics(&self) -> EndpointMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Finish or abort queued calls and unbind. Idempotent.
    pub fn shutdown(&self) {
        let endpoint = self.endpoint.lock().take();
        match endpoint {
            Some(endpoint) => endpoint.shutdown(),
            None => {
                if self.lifecycle.begin_dispose() {
                    self.lifecycle.finish_dispose();
                }
            }
        }
    }
}

impl<C: Codec> Drop for Server<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<C: Codec> std::fmt::Debug for Server<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.address())
            .field("state", &self.state())
            .field("encoding", &C::ENCODING)
            .finish()
    }
}
