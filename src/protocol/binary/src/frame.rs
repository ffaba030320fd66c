// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

/// Everything needed to lay out one binary request frame. The body is
/// written in `extras | key | value` order; the status field of the
/// header carries the vbucket id on requests.
#[derive(Copy, Clone, Debug)]
pub struct RequestFrame<'a> {
    pub opcode: Opcode,
    pub vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: &'a [u8],
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> RequestFrame<'a> {
    pub fn new(opcode: Opcode, key: &'a [u8]) -> Self {
        Self {
            opcode,
            vbucket: 0,
            opaque: 0,
            cas: 0,
            extras: &[],
            key,
            value: &[],
        }
    }

    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.extras.len() + self.key.len() + self.value.len()
    }

    /// Append the encoded frame to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let total_body = (self.extras.len() + self.key.len() + self.value.len()) as u32;

        out.reserve(self.frame_len());
        out.push(REQUEST_MAGIC);
        out.push(self.opcode.into());
        out.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
        out.push(self.extras.len() as u8);
        out.push(0); // data type
        out.extend_from_slice(&self.vbucket.to_be_bytes());
        out.extend_from_slice(&total_body.to_be_bytes());
        out.extend_from_slice(&self.opaque.to_be_bytes());
        out.extend_from_slice(&self.cas.to_be_bytes());
        out.extend_from_slice(self.extras);
        out.extend_from_slice(self.key);
        out.extend_from_slice(self.value);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.frame_len());
        self.encode(&mut out);
        out
    }
}
