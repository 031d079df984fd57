use std::fmt;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Result, RpcError};

/// `(service, method)` pair naming a remote procedure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodId {
    pub service: String,
    pub method: String,
}

impl MethodId {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

/// A request or response body.
///
/// Every serde type is a message, carried as JSON.
pub trait Message: Sized + Send + 'static {
    fn encode(&self) -> Result<Bytes>;
    fn decode(raw: &[u8]) -> Result<Self>;
}

impl<T> Message for T
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| RpcError::Codec(e.to_string()))
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| RpcError::Codec(e.to_string()))
    }
}
