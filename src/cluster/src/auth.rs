// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::request::next_internal_opaque;
use crate::*;
use protocol_binary::RequestFrame;
use std::sync::Arc;

/// Produces per-connection authentication tokens. `None` from
/// `create_token` means the connection needs no authentication.
pub trait Authenticator: Send + Sync {
    fn create_token(&self) -> Option<Box<dyn AuthToken>>;
}

/// Step-wise SASL state for one connection handshake. The token is
/// dropped on every exit path, which releases whatever resources it
/// holds.
pub trait AuthToken: Send {
    /// Advance the handshake. `reply` carries the header and value of
    /// the response to the previous step, or `None` on the first step.
    ///
    /// Returns the step status: `NoError` completes the handshake,
    /// `AuthContinue` means the returned request must be sent and its
    /// reply fed back in, anything else fails the transport.
    fn step(
        &mut self,
        reply: Option<(&ResponseHeader, &[u8])>,
    ) -> (Status, Option<Arc<dyn Request>>);
}

/// SASL `PLAIN`: a single authentication request carrying
/// `\0username\0password`.
pub struct PlainAuthenticator {
    username: String,
    password: String,
}

impl PlainAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for PlainAuthenticator {
    fn create_token(&self) -> Option<Box<dyn AuthToken>> {
        Some(Box::new(PlainToken {
            username: self.username.clone(),
            password: self.password.clone(),
        }))
    }
}

struct PlainToken {
    username: String,
    password: String,
}

impl AuthToken for PlainToken {
    fn step(
        &mut self,
        reply: Option<(&ResponseHeader, &[u8])>,
    ) -> (Status, Option<Arc<dyn Request>>) {
        match reply {
            None => {
                let mut payload =
                    Vec::with_capacity(self.username.len() + self.password.len() + 2);
                payload.push(0);
                payload.extend_from_slice(self.username.as_bytes());
                payload.push(0);
                payload.extend_from_slice(self.password.as_bytes());

                let request = SaslRequest::auth(b"PLAIN".to_vec(), payload);
                (Status::AuthContinue, Some(Arc::new(request)))
            }
            // PLAIN is single-shot: the reply status is the outcome
            Some((header, _)) => (header.status, None),
        }
    }
}

/// An authentication step on the wire. Replies are consumed by the
/// handshake driver, so the request itself has nothing to deliver.
pub(crate) struct SaslRequest {
    opcode: Opcode,
    mechanism: Vec<u8>,
    payload: Vec<u8>,
    opaque: u32,
}

impl SaslRequest {
    pub(crate) fn auth(mechanism: Vec<u8>, payload: Vec<u8>) -> Self {
        Self {
            opcode: Opcode::SaslAuth,
            mechanism,
            payload,
            opaque: next_internal_opaque(),
        }
    }
}

impl Request for SaslRequest {
    fn request_id(&self) -> u32 {
        self.opaque
    }

    fn key(&self) -> &[u8] {
        &[]
    }

    fn replicas(&self) -> u8 {
        0
    }

    fn policy(&self) -> ReplyPolicy {
        ReplyPolicy::AnyOk
    }

    fn vbucket(&self) -> u16 {
        0
    }

    fn set_vbucket(&self, _vbucket: u16) {}

    fn query_buffer(&self) -> Vec<u8> {
        RequestFrame {
            opcode: self.opcode,
            vbucket: 0,
            opaque: self.opaque,
            cas: 0,
            extras: &[],
            key: &self.mechanism,
            value: &self.payload,
        }
        .to_vec()
    }

    fn handle_response(&self, _response: &Response<'_>) {}

    fn fail(&self) {}
}
