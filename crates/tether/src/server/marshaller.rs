use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tether_core::wire::{self, ReplyHeader, WireError};
use tether_core::{
    BoxError, Codec, ErrorCode, Interface, MethodSig, Params, PostcardCodec, Returns, RpcError,
    SecurityHandler,
};

/// What a bound method produced, already encoded.
pub(crate) enum Outcome {
    Value(Vec<u8>),
    Null,
    EncodeFailed(String),
}

type Invoker<C> = Box<dyn Fn(&Params<C>) -> Result<Outcome, BoxError> + Send + Sync>;

/// An interface together with an implementation of each of its methods.
///
/// Method implementations receive the decoded [`Params`] and return
/// `Result<_, BoxError>`. Returning an [`RpcError`] sends its code to the
/// caller; any other error is reported as `Unknown`.
pub struct ServiceBinding<C: Codec = PostcardCodec> {
    interface: Interface,
    invokers: HashMap<String, (Returns, Invoker<C>)>,
}

impl<C: Codec> ServiceBinding<C> {
    pub fn new(interface: Interface) -> Self {
        ServiceBinding {
            interface,
            invokers: HashMap::new(),
        }
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    /// Implement a method returning a value. Binding a name again replaces
    /// the earlier implementation.
    pub fn bind<R, F>(self, method: &str, f: F) -> Self
    where
        R: Serialize + 'static,
        F: Fn(&Params<C>) -> Result<R, BoxError> + Send + Sync + 'static,
    {
        self.bind_optional(method, move |params: &Params<C>| f(params).map(Some))
    }

    /// Implement a method whose value may be null.
    pub fn bind_optional<R, F>(mut self, method: &str, f: F) -> Self
    where
        R: Serialize + 'static,
        F: Fn(&Params<C>) -> Result<Option<R>, BoxError> + Send + Sync + 'static,
    {
        let invoker: Invoker<C> = Box::new(move |params: &Params<C>| {
            Ok(match f(params)? {
                Some(value) => match C::encode(&value) {
                    Ok(bytes) => Outcome::Value(bytes),
                    Err(err) => Outcome::EncodeFailed(err.to_string()),
                },
                None => Outcome::Null,
            })
        });
        self.invokers
            .insert(method.to_owned(), (Returns::Value, invoker));
        self
    }

    pub fn bind_void<F>(mut self, method: &str, f: F) -> Self
    where
        F: Fn(&Params<C>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let invoker: Invoker<C> =
            Box::new(move |params: &Params<C>| f(params).map(|()| Outcome::Null));
        self.invokers
            .insert(method.to_owned(), (Returns::Void, invoker));
        self
    }
}

impl<C: Codec> fmt::Debug for ServiceBinding<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.invokers.keys().collect();
        methods.sort();
        f.debug_struct("ServiceBinding")
            .field("interface", &self.interface.name())
            .field("methods", &methods)
            .finish()
    }
}

struct Method<C: Codec> {
    sig: MethodSig,
    invoker: Invoker<C>,
}

struct Service<C: Codec> {
    methods: HashMap<String, Method<C>>,
}

/// A decoded call, ready to run.
pub(crate) struct Dispatch<C: Codec> {
    service: Arc<Service<C>>,
    method: String,
    params: Params<C>,
}

impl<C: Codec> Dispatch<C> {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn invoke(&self) -> Result<Outcome, BoxError> {
        match self.service.methods.get(&self.method) {
            Some(method) => (method.invoker)(&self.params),
            None => Err(RpcError::internal(format!("method {} vanished", self.method)).into()),
        }
    }
}

/// Registered services and the call / reply payload codec on the server side.
pub(crate) struct ServerMarshaller<C: Codec> {
    security: Arc<dyn SecurityHandler>,
    services: RwLock<HashMap<String, Arc<Service<C>>>>,
}

impl<C: Codec> ServerMarshaller<C> {
    pub fn new(security: Arc<dyn SecurityHandler>) -> Self {
        ServerMarshaller {
            security,
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Build the binding's method table and make it callable.
    pub fn register(&self, binding: ServiceBinding<C>) -> Result<(), RpcError> {
        let ServiceBinding {
            interface,
            mut invokers,
        } = binding;
        let service_name = interface.name().to_owned();
        let table = interface.method_table()?;

        if let Some(stray) = invokers.keys().find(|name| !table.contains(name)) {
            return Err(RpcError::invalid_argument(format!(
                "{stray} is not a method of {service_name}."
            )));
        }

        let mut methods = HashMap::with_capacity(table.len());
        for sig in table.iter() {
            let Some((returns, invoker)) = invokers.remove(&sig.name) else {
                return Err(RpcError::unimplemented(format!(
                    "Method {service_name}.{} has no implementation.",
                    sig.name
                )));
            };
            if returns != sig.returns {
                return Err(RpcError::invalid_argument(format!(
                    "Method {service_name}.{} returns {}, but was bound as returning {returns}.",
                    sig.name, sig.returns
                )));
            }
            methods.insert(
                sig.name.clone(),
                Method {
                    sig: sig.clone(),
                    invoker,
                },
            );
        }

        let mut services = self.services.write();
        if services.contains_key(&service_name) {
            return Err(RpcError::new(
                ErrorCode::AlreadyExists,
                format!("Service {service_name} is already registered."),
            ));
        }
        tracing::debug!(service = %service_name, methods = methods.len(), "service registered");
        services.insert(service_name, Arc::new(Service { methods }));
        Ok(())
    }

    /// Authenticate and decode a call payload.
    ///
    /// Runs on the thread that will execute the call, so a security handler
    /// can install per-thread state for the method.
    pub fn unmarshal_call(&self, payload: &[u8]) -> Result<Dispatch<C>, RpcError> {
        let call = wire::decode_call(payload).map_err(|err| {
            RpcError::unimplemented(format!("Failed to deserialize method arguments. {err}"))
        })?;
        let header = call.header;

        let secret = self.security.decode_secret(header.secret.as_deref());
        if let Err(err) = self.security.take_security_measures(secret.as_deref()) {
            tracing::warn!(
                service = %header.service,
                method = %header.method,
                %err,
                "call refused by security handler"
            );
            return Err(RpcError::new(
                ErrorCode::Unauthenticated,
                "Failed to authenticate a remote call.",
            ));
        }

        let Some(service) = self.services.read().get(&header.service).cloned() else {
            return Err(RpcError::not_found(format!(
                "Service {} is not registered.",
                header.service
            )));
        };
        let Some(method) = service.methods.get(&header.method) else {
            return Err(RpcError::not_found(format!(
                "Method {}.{} is not found.",
                header.service, header.method
            )));
        };

        let arity = method.sig.arity;
        let mut values = call.args;
        if values.len() > arity {
            return Err(RpcError::invalid_argument(format!(
                "Method {}.{} takes {arity} arguments, {} were sent.",
                header.service,
                header.method,
                values.len()
            )));
        }
        values.resize(arity, None);

        Ok(Dispatch {
            service,
            method: header.method,
            params: Params::from_values(values),
        })
    }

    pub fn marshal_outcome(&self, outcome: Outcome) -> Bytes {
        match outcome {
            Outcome::Value(value) => encode_reply(&ReplyHeader::ok(false), Some(&value)),
            Outcome::Null => encode_reply(&ReplyHeader::ok(true), None),
            Outcome::EncodeFailed(err) => self.marshal_error(&RpcError::unimplemented(format!(
                "Failed to serialize reply. {err}"
            ))),
        }
    }

    pub fn marshal_error(&self, err: &RpcError) -> Bytes {
        error_reply(err)
    }
}

/// A reply payload carrying `err` and no value.
pub(crate) fn error_reply(err: &RpcError) -> Bytes {
    encode_reply(&ReplyHeader::error(err.code, err.message.clone()), None)
}

fn encode_reply(header: &ReplyHeader, value: Option<&[u8]>) -> Bytes {
    reply_or_internal(wire::encode_reply(header, value))
}

/// A header that failed to encode still gets an answer the client can decode.
fn reply_or_internal(encoded: Result<Vec<u8>, WireError>) -> Bytes {
    match encoded {
        Ok(payload) => Bytes::from(payload),
        Err(err) => {
            tracing::error!(%err, "failed to encode reply, answering Internal");
            Bytes::from_static(wire::INTERNAL_ERROR_REPLY)
        }
    }
}
