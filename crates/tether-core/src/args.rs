//! Positional argument values.
//!
//! Callers build an [`Args`] list, encoding each value with the channel's
//! codec as it is pushed. Handlers read the same positions back through
//! [`Params`]. A null argument occupies its position but puts nothing on the
//! wire.

use std::fmt;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};

use crate::codec::{Codec, PostcardCodec};
use crate::error::RpcError;

/// Encoded positional arguments for one call.
pub struct Args<C: Codec = PostcardCodec> {
    values: Vec<Option<Vec<u8>>>,
    _codec: PhantomData<fn() -> C>,
}

impl<C: Codec> Args<C> {
    pub fn new() -> Self {
        Args {
            values: Vec::new(),
            _codec: PhantomData,
        }
    }

    /// Append a non-null argument.
    pub fn arg<T: Serialize>(mut self, value: &T) -> Result<Self, RpcError> {
        let encoded = C::encode(value).map_err(|err| {
            RpcError::unimplemented(format!("Failed to serialize method arguments. {err}"))
        })?;
        self.values.push(Some(encoded));
        Ok(self)
    }

    /// Append an argument that may be null.
    pub fn optional<T: Serialize>(self, value: Option<&T>) -> Result<Self, RpcError> {
        match value {
            Some(value) => self.arg(value),
            None => Ok(self.null()),
        }
    }

    pub fn null(mut self) -> Self {
        self.values.push(None);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Option<Vec<u8>>] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Option<Vec<u8>>> {
        self.values
    }
}

impl<C: Codec> Default for Args<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> fmt::Debug for Args<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Args")
            .field("encoding", &C::ENCODING)
            .field("len", &self.values.len())
            .finish()
    }
}

/// Decoded call arguments as seen by a handler.
///
/// There is one position per declared parameter; positions the caller left
/// null, or did not send, read as null.
pub struct Params<C: Codec = PostcardCodec> {
    values: Vec<Option<Vec<u8>>>,
    _codec: PhantomData<fn() -> C>,
}

impl<C: Codec> Params<C> {
    pub fn from_values(values: Vec<Option<Vec<u8>>>) -> Self {
        Params {
            values,
            _codec: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_null(&self, index: usize) -> bool {
        !matches!(self.values.get(index), Some(Some(_)))
    }

    /// Decode a non-null argument.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, RpcError> {
        match self.optional(index)? {
            Some(value) => Ok(value),
            None => Err(RpcError::invalid_argument(format!(
                "Argument {index} is null."
            ))),
        }
    }

    /// Decode an argument that may be null.
    pub fn optional<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, RpcError> {
        let Some(slot) = self.values.get(index) else {
            return Err(RpcError::invalid_argument(format!(
                "Argument {index} is out of range, the method takes {}.",
                self.values.len()
            )));
        };
        slot.as_deref()
            .map(|bytes| C::decode(bytes))
            .transpose()
            .map_err(|err| {
                RpcError::unimplemented(format!("Failed to deserialize method arguments. {err}"))
            })
    }
}

impl<C: Codec> fmt::Debug for Params<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Params")
            .field("encoding", &C::ENCODING)
            .field("len", &self.values.len())
            .finish()
    }
}
