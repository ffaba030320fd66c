// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HeaderError {
    #[error("short header: {0} bytes")]
    Incomplete(usize),
    #[error("bad response magic: {0:#04x}")]
    BadMagic(u8),
    #[error("body length {total} shorter than key length {key} plus extras length {extras}")]
    BadBodyLength { total: u32, key: u16, extras: u8 },
}

/// A decoded response header. Multibyte fields are network byte order on
/// the wire; they are held here in native order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    pub status: Status,
    pub total_body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    /// Decode a response header from the first `HEADER_LEN` bytes of
    /// `buf`. Enforces the response magic and the invariant that the
    /// total body is at least as long as the key and extras it contains.
    pub fn parse(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_LEN {
            return Err(HeaderError::Incomplete(buf.len()));
        }

        if buf[0] != RESPONSE_MAGIC {
            return Err(HeaderError::BadMagic(buf[0]));
        }

        let opcode = buf[1];
        let key_len = u16::from_be_bytes([buf[2], buf[3]]);
        let extras_len = buf[4];
        let data_type = buf[5];
        let status = Status::from_u16(u16::from_be_bytes([buf[6], buf[7]]));
        let total_body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let opaque = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let cas = u64::from_be_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]);

        if (total_body_len as usize) < key_len as usize + extras_len as usize {
            return Err(HeaderError::BadBodyLength {
                total: total_body_len,
                key: key_len,
                extras: extras_len,
            });
        }

        Ok(Self {
            opcode,
            key_len,
            extras_len,
            data_type,
            status,
            total_body_len,
            opaque,
            cas,
        })
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode)
    }

    /// Length of the value portion of the body.
    pub fn value_len(&self) -> usize {
        self.total_body_len as usize - self.key_len as usize - self.extras_len as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(
        opcode: u8,
        key_len: u16,
        extras_len: u8,
        status: u16,
        total: u32,
        opaque: u32,
        cas: u64,
    ) -> [u8; HEADER_LEN] {
        let mut buf = [0; HEADER_LEN];
        buf[0] = RESPONSE_MAGIC;
        buf[1] = opcode;
        buf[2..4].copy_from_slice(&key_len.to_be_bytes());
        buf[4] = extras_len;
        buf[6..8].copy_from_slice(&status.to_be_bytes());
        buf[8..12].copy_from_slice(&total.to_be_bytes());
        buf[12..16].copy_from_slice(&opaque.to_be_bytes());
        buf[16..24].copy_from_slice(&cas.to_be_bytes());
        buf
    }

    #[test]
    fn parse() {
        let buf = encode(0x00, 5, 4, 0x0000, 14, 0xdead_beef, 42);
        let header = ResponseHeader::parse(&buf).unwrap();
        assert_eq!(header.opcode(), Some(Opcode::Get));
        assert_eq!(header.key_len, 5);
        assert_eq!(header.extras_len, 4);
        assert_eq!(header.status, Status::NoError);
        assert_eq!(header.total_body_len, 14);
        assert_eq!(header.opaque, 0xdead_beef);
        assert_eq!(header.cas, 42);
        assert_eq!(header.value_len(), 5);
    }

    #[test]
    fn parse_short() {
        let buf = encode(0x00, 0, 0, 0, 0, 0, 0);
        assert_eq!(
            ResponseHeader::parse(&buf[0..10]),
            Err(HeaderError::Incomplete(10))
        );
    }

    #[test]
    fn parse_bad_magic() {
        let mut buf = encode(0x00, 0, 0, 0, 0, 0, 0);
        buf[0] = REQUEST_MAGIC;
        assert_eq!(
            ResponseHeader::parse(&buf),
            Err(HeaderError::BadMagic(0x80))
        );
    }

    #[test]
    fn parse_bad_body_length() {
        // key + extras exceed the total body length
        let buf = encode(0x00, 5, 4, 0, 8, 0, 0);
        assert!(matches!(
            ResponseHeader::parse(&buf),
            Err(HeaderError::BadBodyLength { .. })
        ));
    }
}
