// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Length-prefixed wire primitives.
//!
//! Every integer on the wire is big-endian. Strings and binary fields carry
//! a `u32` length prefix followed by the raw bytes.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

pub fn put_binary(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

pub fn get_u8(buf: &mut Bytes, field: &'static str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::Truncated(field));
    }
    Ok(buf.get_u8())
}

pub fn get_u32(buf: &mut Bytes, field: &'static str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::Truncated(field));
    }
    Ok(buf.get_u32())
}

pub fn get_binary(buf: &mut Bytes, field: &'static str) -> Result<Bytes> {
    let len = get_u32(buf, field)? as usize;
    if buf.remaining() < len {
        return Err(Error::LengthOutOfBounds { field, len });
    }
    Ok(buf.split_to(len))
}

pub fn get_string(buf: &mut Bytes, field: &'static str) -> Result<String> {
    let bytes = get_binary(buf, field)?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

pub fn get_fixed(buf: &mut Bytes, len: usize, field: &'static str) -> Result<Bytes> {
    if buf.remaining() < len {
        return Err(Error::Truncated(field));
    }
    Ok(buf.split_to(len))
}
