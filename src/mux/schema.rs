//! Schema exchange.
//!
//! A conversation can fetch message schema definitions from its peer by id.
//! The schema bytes are opaque here; only their exchange is handled. The
//! answering side looks them up through a [`SchemaProvider`].
//!
//! Reply payload: status byte, then the schema (`FOUND`), nothing
//! (`NOT_FOUND`) or a UTF-8 reason (`INTERNAL`).

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;

use crate::error::{JfapError, Result};

const STATUS_FOUND: u8 = 0x00;
const STATUS_NOT_FOUND: u8 = 0x01;
const STATUS_INTERNAL: u8 = 0x02;

/// Source of schema definitions served to the peer
pub trait SchemaProvider: Send + Sync {
    /// Look up a schema. `Ok(None)` means the id is unknown; `Err` means the
    /// lookup itself failed and is reported to the peer as an internal error.
    fn schema(&self, id: u64) -> Result<Option<Bytes>>;
}

/// Schemas held in memory
#[derive(Debug, Default)]
pub struct InMemorySchemas {
    schemas: RwLock<HashMap<u64, Bytes>>,
}

impl InMemorySchemas {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a schema
    pub fn insert(&self, id: u64, schema: impl Into<Bytes>) {
        self.schemas.write().insert(id, schema.into());
    }
}

impl SchemaProvider for InMemorySchemas {
    fn schema(&self, id: u64) -> Result<Option<Bytes>> {
        Ok(self.schemas.read().get(&id).cloned())
    }
}

/// Decoded schema reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SchemaReply {
    Found(Bytes),
    NotFound,
    Internal(String),
}

impl SchemaReply {
    /// Answer a request payload with `provider`
    pub fn answer(provider: Option<&dyn SchemaProvider>, request: &[u8]) -> Self {
        let Ok(id) = <[u8; 8]>::try_from(request).map(u64::from_be_bytes) else {
            return Self::Internal(format!(
                "schema request of {} bytes, expected 8",
                request.len()
            ));
        };
        match provider {
            None => Self::Internal("no schema provider installed".to_string()),
            Some(p) => match p.schema(id) {
                Ok(Some(schema)) => Self::Found(schema),
                Ok(None) => Self::NotFound,
                Err(e) => Self::Internal(e.to_string()),
            },
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Found(schema) => {
                buf.put_u8(STATUS_FOUND);
                buf.put_slice(schema);
            },
            Self::NotFound => buf.put_u8(STATUS_NOT_FOUND),
            Self::Internal(reason) => {
                buf.put_u8(STATUS_INTERNAL);
                buf.put_slice(reason.as_bytes());
            },
        }
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self> {
        match payload.first() {
            Some(&STATUS_FOUND) => Ok(Self::Found(payload.slice(1..))),
            Some(&STATUS_NOT_FOUND) => Ok(Self::NotFound),
            Some(&STATUS_INTERNAL) => Ok(Self::Internal(
                String::from_utf8_lossy(&payload[1..]).into_owned(),
            )),
            Some(other) => Err(JfapError::Framing(format!(
                "unknown schema reply status 0x{other:02x}"
            ))),
            None => Err(JfapError::Framing("empty schema reply".to_string())),
        }
    }

    /// Convert to the caller-facing result
    pub fn into_result(self) -> Result<Option<Bytes>> {
        match self {
            Self::Found(schema) => Ok(Some(schema)),
            Self::NotFound => Ok(None),
            Self::Internal(reason) => Err(JfapError::Internal(reason)),
        }
    }
}

/// Encode a schema request
pub(crate) fn encode_request(id: u64) -> Bytes {
    Bytes::copy_from_slice(&id.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl SchemaProvider for Broken {
        fn schema(&self, _id: u64) -> Result<Option<Bytes>> {
            Err(JfapError::Internal("schema store offline".into()))
        }
    }

    #[test]
    fn test_found_and_not_found() {
        let store = InMemorySchemas::new();
        store.insert(7, Bytes::from_static(b"schema-7"));

        let reply = SchemaReply::answer(Some(&store), &encode_request(7));
        let decoded = SchemaReply::decode(&reply.encode()).unwrap();
        assert_eq!(decoded.into_result().unwrap(), Some(Bytes::from_static(b"schema-7")));

        let reply = SchemaReply::answer(Some(&store), &encode_request(8));
        assert_eq!(reply.into_result().unwrap(), None);
    }

    #[test]
    fn test_provider_failure_is_internal_not_missing() {
        let reply = SchemaReply::answer(Some(&Broken), &encode_request(1));
        let decoded = SchemaReply::decode(&reply.encode()).unwrap();
        assert!(matches!(decoded.into_result(), Err(JfapError::Internal(_))));

        let reply = SchemaReply::answer(None, &encode_request(1));
        assert!(matches!(reply, SchemaReply::Internal(_)));

        let reply = SchemaReply::answer(Some(&Broken), &[1, 2]);
        assert!(matches!(reply, SchemaReply::Internal(_)));
    }
}
