use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tether_core::wire::{self, MAX_ARGS};
use tether_core::{Args, Codec, Interface, MethodTable, Returns, RpcError, SecurityHandler};

/// Turns method invocations into call payloads and reply payloads back into
/// values.
pub(crate) struct ClientMarshaller<C: Codec> {
    security: Arc<dyn SecurityHandler>,
    /// Method tables by interface name, built on first use.
    tables: RwLock<HashMap<String, Arc<MethodTable>>>,
    _codec: PhantomData<fn() -> C>,
}

impl<C: Codec> ClientMarshaller<C> {
    pub fn new(security: Arc<dyn SecurityHandler>) -> Self {
        ClientMarshaller {
            security,
            tables: RwLock::new(HashMap::new()),
            _codec: PhantomData,
        }
    }

    fn table(&self, interface: &Interface) -> Result<Arc<MethodTable>, RpcError> {
        if let Some(table) = self.tables.read().get(interface.name()) {
            return Ok(table.clone());
        }
        let table = Arc::new(interface.method_table()?);
        self.tables
            .write()
            .insert(interface.name().to_owned(), table.clone());
        Ok(table)
    }

    pub fn marshal_call(
        &self,
        interface: &Interface,
        method: &str,
        returns: Returns,
        args: Args<C>,
    ) -> Result<Bytes, RpcError> {
        let table = self.table(interface)?;
        let Some(sig) = table.get(method) else {
            return Err(RpcError::not_found(format!(
                "Method {method} is not declared by {}.",
                interface.name()
            )));
        };
        if sig.returns != returns {
            return Err(RpcError::invalid_argument(format!(
                "Method {}.{method} returns {}, but was invoked expecting {returns}.",
                interface.name(),
                sig.returns
            )));
        }

        let values = args.into_values();
        if values.len() > MAX_ARGS {
            return Err(RpcError::invalid_argument(format!(
                "{} arguments given, at most {MAX_ARGS} are supported.",
                values.len()
            )));
        }
        if values.len() != sig.arity {
            return Err(RpcError::invalid_argument(format!(
                "Method {}.{method} takes {} arguments, {} given.",
                interface.name(),
                sig.arity,
                values.len()
            )));
        }

        let secret = self.security.secret();
        let encoded_secret = self.security.encode_secret(secret.as_deref());
        let payload = wire::encode_call(interface.name(), method, encoded_secret, &values)
            .map_err(|err| RpcError::unimplemented(format!("Failed to serialize call. {err}")))?;
        Ok(Bytes::from(payload))
    }

    /// Decode a reply. `Ok(None)` is a null reply, and the only success for a
    /// void method.
    pub fn unmarshal_reply<R: DeserializeOwned>(
        &self,
        returns: Returns,
        payload: &Bytes,
    ) -> Result<Option<R>, RpcError> {
        let (header, value) = wire::decode_reply(payload)
            .map_err(|err| RpcError::unimplemented(format!("Failed to deserialize reply. {err}")))?;

        if !header.error_code.is_ok() {
            let message = header
                .error_description
                .unwrap_or_else(|| header.error_code.description().to_owned());
            return Err(RpcError::new(header.error_code, message));
        }

        match (returns, value) {
            (_, None) => Ok(None),
            (Returns::Void, Some(_)) => Err(RpcError::internal(
                "Void method returned a value.",
            )),
            (Returns::Value, Some(bytes)) => C::decode(&bytes).map(Some).map_err(|err| {
                RpcError::unimplemented(format!("Failed to deserialize reply. {err}"))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tether_core::wire::ReplyHeader;
    use tether_core::{ErrorCode, NullSecurityHandler, Params, PostcardCodec};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entity {
        id: u32,
        name: String,
        description: Option<String>,
        marks: Vec<f64>,
    }

    fn jobs() -> Interface {
        Interface::new("demo.Jobs")
            .method("void_job", 0, Returns::Void)
            .method("complex_job", 4, Returns::Value)
    }

    fn marshaller() -> ClientMarshaller<PostcardCodec> {
        ClientMarshaller::new(Arc::new(NullSecurityHandler))
    }

    #[test]
    fn call_round_trip_keeps_null_positions() {
        let entity = Entity {
            id: 7,
            name: "n".into(),
            description: None,
            marks: vec![0.5, f64::MAX, -0.0],
        };
        let args = Args::new()
            .arg(&entity)
            .unwrap()
            .null()
            .arg(&193i32)
            .unwrap()
            .null();
        let payload = marshaller()
            .marshal_call(&jobs(), "complex_job", Returns::Value, args)
            .unwrap();

        let decoded = wire::decode_call(&payload).unwrap();
        assert_eq!(decoded.header.args_presence.bits(), 0b101);
        let mut values = decoded.args;
        values.resize(4, None);
        let params = Params::<PostcardCodec>::from_values(values);
        let back: Entity = params.get(0).unwrap();
        assert_eq!(back, entity);
        assert_eq!(back.marks[2].to_bits(), (-0.0f64).to_bits());
        assert!(params.is_null(1));
        assert_eq!(params.get::<i32>(2).unwrap(), 193);
        assert!(params.is_null(3));
    }

    #[test]
    fn call_shape_is_checked_before_sending() {
        let m = marshaller();
        let err = m
            .marshal_call(&jobs(), "missing", Returns::Void, Args::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);

        let err = m
            .marshal_call(&jobs(), "void_job", Returns::Value, Args::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);

        let err = m
            .marshal_call(&jobs(), "complex_job", Returns::Value, Args::new().null())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);

        let mut many = Args::new();
        for _ in 0..=MAX_ARGS {
            many = many.null();
        }
        let err = m
            .marshal_call(&jobs(), "complex_job", Returns::Value, many)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn overloaded_interface_cannot_be_called() {
        let iface = Interface::new("demo.Over")
            .method("m", 0, Returns::Void)
            .extends(Interface::new("demo.Base").method("m", 1, Returns::Void));
        let err = marshaller()
            .marshal_call(&iface, "m", Returns::Void, Args::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Unimplemented);
    }

    #[test]
    fn reply_values_and_errors() {
        let m = marshaller();

        let value = PostcardCodec::encode(&42i32).unwrap();
        let ok = Bytes::from(wire::encode_reply(&ReplyHeader::ok(false), Some(&value)).unwrap());
        assert_eq!(m.unmarshal_reply::<i32>(Returns::Value, &ok).unwrap(), Some(42));

        let null = Bytes::from(wire::encode_reply(&ReplyHeader::ok(true), None).unwrap());
        assert_eq!(m.unmarshal_reply::<i32>(Returns::Value, &null).unwrap(), None);
        assert_eq!(m.unmarshal_reply::<()>(Returns::Void, &null).unwrap(), None);

        let err = m.unmarshal_reply::<()>(Returns::Void, &ok).unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);

        let err = m.unmarshal_reply::<String>(Returns::Value, &ok).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unimplemented);

        let failed = Bytes::from(
            wire::encode_reply(
                &ReplyHeader::error(ErrorCode::PermissionDenied, "not yours"),
                None,
            )
            .unwrap(),
        );
        let err = m.unmarshal_reply::<i32>(Returns::Value, &failed).unwrap_err();
        assert_eq!(err, RpcError::permission_denied("not yours"));

        let garbage = Bytes::from_static(&[0xff, 0xff]);
        let err = m.unmarshal_reply::<i32>(Returns::Value, &garbage).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unimplemented);
    }
}
