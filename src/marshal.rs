//! Payload encodings for the worker-pool wire.

use std::io;

use serde_json::Value;

use crate::{Error, Result};

/// Length prefix marking a null element in the flat encoding, distinct
/// from a zero-length string.
const FLAT_NULL: u32 = u32::MAX;

fn bad_data(msg: &str) -> Error {
    Error::io(
        "unmarshall",
        io::Error::new(io::ErrorKind::InvalidData, msg.to_string()),
    )
}

/// A strategy for encoding worker-call payloads.
///
/// Host and worker must agree on the marshaller; it is fixed by the
/// pool's type parameter on both sides rather than inferred from the
/// wire.
pub trait Marshaller: Clone + 'static {
    /// The value type carried in argument and return lists.
    type Value: Clone + 'static;

    /// Encodes an argument list.
    fn marshall_args(&self, args: &[Self::Value]) -> Result<Vec<u8>>;

    /// Decodes an argument list.
    fn unmarshall_args(&self, bytes: &[u8]) -> Result<Vec<Self::Value>>;

    /// Encodes a return list.
    fn marshall_ret(&self, ret: &[Self::Value]) -> Result<Vec<u8>>;

    /// Decodes a return list.
    fn unmarshall_ret(&self, bytes: &[u8]) -> Result<Vec<Self::Value>>;
}

/// The flat encoding: a sequence of strings and nulls, each prefixed by
/// a host-endian `u32` length, with `u32::MAX` marking a null.
///
/// Only suitable when every argument and return value is a string or
/// null; anything structured needs [`StorableMarshaller`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FlatMarshaller;

impl FlatMarshaller {
    fn encode(values: &[Option<String>]) -> Vec<u8> {
        let mut out = Vec::new();
        for value in values {
            match value {
                None => out.extend_from_slice(&FLAT_NULL.to_ne_bytes()),
                Some(s) => {
                    out.extend_from_slice(&(s.len() as u32).to_ne_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
            }
        }
        out
    }

    fn decode(mut bytes: &[u8]) -> Result<Vec<Option<String>>> {
        let mut values = Vec::new();
        while !bytes.is_empty() {
            if bytes.len() < 4 {
                return Err(bad_data("truncated length prefix"));
            }
            let len = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            bytes = &bytes[4..];
            if len == FLAT_NULL {
                values.push(None);
                continue;
            }
            let len = len as usize;
            if bytes.len() < len {
                return Err(bad_data("truncated element"));
            }
            let s = std::str::from_utf8(&bytes[..len])
                .map_err(|_| bad_data("element is not valid UTF-8"))?;
            values.push(Some(s.to_string()));
            bytes = &bytes[len..];
        }
        Ok(values)
    }
}

impl Marshaller for FlatMarshaller {
    type Value = Option<String>;

    fn marshall_args(&self, args: &[Self::Value]) -> Result<Vec<u8>> {
        Ok(FlatMarshaller::encode(args))
    }

    fn unmarshall_args(&self, bytes: &[u8]) -> Result<Vec<Self::Value>> {
        FlatMarshaller::decode(bytes)
    }

    fn marshall_ret(&self, ret: &[Self::Value]) -> Result<Vec<u8>> {
        Ok(FlatMarshaller::encode(ret))
    }

    fn unmarshall_ret(&self, bytes: &[u8]) -> Result<Vec<Self::Value>> {
        FlatMarshaller::decode(bytes)
    }
}

/// The storable encoding: one opaque serialised blob per list, able to
/// carry arbitrarily nested structures.
#[derive(Clone, Copy, Debug, Default)]
pub struct StorableMarshaller;

impl StorableMarshaller {
    fn encode(values: &[Value]) -> Result<Vec<u8>> {
        serde_json::to_vec(values).map_err(|e| {
            Error::io(
                "marshall",
                io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
            )
        })
    }

    fn decode(bytes: &[u8]) -> Result<Vec<Value>> {
        serde_json::from_slice(bytes).map_err(|e| bad_data(&e.to_string()))
    }
}

impl Marshaller for StorableMarshaller {
    type Value = Value;

    fn marshall_args(&self, args: &[Self::Value]) -> Result<Vec<u8>> {
        StorableMarshaller::encode(args)
    }

    fn unmarshall_args(&self, bytes: &[u8]) -> Result<Vec<Self::Value>> {
        StorableMarshaller::decode(bytes)
    }

    fn marshall_ret(&self, ret: &[Self::Value]) -> Result<Vec<u8>> {
        StorableMarshaller::encode(ret)
    }

    fn unmarshall_ret(&self, bytes: &[u8]) -> Result<Vec<Self::Value>> {
        StorableMarshaller::decode(bytes)
    }
}
