// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;
use protocol_binary::RequestFrame;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Mutex;

// opaques for requests the core generates itself (quit, auth) are drawn
// from the top half of the id space to stay clear of caller-chosen ids
static INTERNAL_OPAQUE: AtomicU32 = AtomicU32::new(0x8000_0000);

pub(crate) fn next_internal_opaque() -> u32 {
    INTERNAL_OPAQUE.fetch_add(1, Ordering::Relaxed)
}

/// Reply aggregation policy for redundant dispatch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// Succeed on the first `NoError` reply.
    AnyOk,
    /// Succeed only if every reply is `NoError`.
    AllOk,
}

/// One reply as delivered to a request: the decoded header plus the
/// slices of the body, `None` where the corresponding section is empty.
pub struct Response<'a> {
    pub header: ResponseHeader,
    pub key: Option<&'a [u8]>,
    pub extras: Option<&'a [u8]>,
    pub value: Option<&'a [u8]>,
}

/// The capabilities the core needs from a request. Implementations must
/// use interior mutability: a request is shared across nodes for
/// redundant dispatch and its replies arrive on the driver thread.
pub trait Request: Send + Sync {
    /// The opaque identifier embedded in the request frame.
    fn request_id(&self) -> u32;

    /// Key bytes for key-hashing locators. Empty for keyless operations.
    fn key(&self) -> &[u8];

    /// Number of additional nodes this request is dispatched to.
    fn replicas(&self) -> u8;

    fn policy(&self) -> ReplyPolicy;

    fn vbucket(&self) -> u16;

    /// Set by the vbucket locator before dispatch; the assigned bucket is
    /// embedded in the frame so the owning server accepts the request.
    fn set_vbucket(&self, vbucket: u16);

    /// The fully formed binary frame for this request.
    fn query_buffer(&self) -> Vec<u8>;

    /// Deliver one reply. May be invoked up to `replicas() + 1` times.
    fn handle_response(&self, response: &Response<'_>);

    /// Deliver a client-side failure, equivalent to a reply with status
    /// `InternalError` and no body.
    fn fail(&self);
}

pub(crate) enum TrackerAction {
    Ignore,
    Fire(Status),
}

/// Tracks the `replicas + 1` expected events for one request and decides
/// when the completion callback fires and with which status. The
/// callback fires exactly once.
pub(crate) struct ReplyTracker {
    policy: ReplyPolicy,
    state: Mutex<TrackerState>,
}

struct TrackerState {
    remaining: u32,
    fired: bool,
    status: Option<Status>,
}

impl ReplyTracker {
    pub fn new(replicas: u8, policy: ReplyPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(TrackerState {
                remaining: replicas as u32 + 1,
                fired: false,
                status: None,
            }),
        }
    }

    pub fn on_event(&self, status: Status) -> TrackerAction {
        let mut state = self.state.lock().unwrap();

        if state.remaining == 0 {
            // an event beyond the expected count
            return TrackerAction::Ignore;
        }
        state.remaining -= 1;

        if state.fired {
            return TrackerAction::Ignore;
        }

        match self.policy {
            ReplyPolicy::AnyOk => {
                if status.is_ok() {
                    state.fired = true;
                    return TrackerAction::Fire(status);
                }
                // keep the most authoritative failure seen so far
                state.status = match state.status.take() {
                    Some(prev) if prev.rank() <= status.rank() => Some(prev),
                    _ => Some(status),
                };
                if state.remaining == 0 {
                    state.fired = true;
                    return TrackerAction::Fire(state.status.unwrap_or(Status::InternalError));
                }
            }
            ReplyPolicy::AllOk => {
                if !status.is_ok() && state.status.is_none() {
                    state.status = Some(status);
                }
                if state.remaining == 0 {
                    state.fired = true;
                    return TrackerAction::Fire(state.status.unwrap_or(Status::NoError));
                }
            }
        }

        TrackerAction::Ignore
    }
}

/// Completion callback: final status plus the value bytes when the
/// status is `NoError` and the winning reply carried a value.
pub type CompletionCallback = Box<dyn FnOnce(Status, Option<Vec<u8>>) + Send>;

/// A generic single-key operation. This is the construction surface the
/// core itself needs; a typed client api layers on top of it.
pub struct OpRequest {
    opcode: Opcode,
    key: Vec<u8>,
    extras: Vec<u8>,
    value: Vec<u8>,
    cas: u64,
    opaque: u32,
    replicas: u8,
    policy: ReplyPolicy,
    vbucket: AtomicU16,
    tracker: ReplyTracker,
    callback: Mutex<Option<CompletionCallback>>,
}

impl OpRequest {
    pub fn new(opcode: Opcode, key: impl Into<Vec<u8>>, opaque: u32) -> Self {
        Self {
            opcode,
            key: key.into(),
            extras: Vec::new(),
            value: Vec::new(),
            cas: 0,
            opaque,
            replicas: 0,
            policy: ReplyPolicy::AnyOk,
            vbucket: AtomicU16::new(0),
            tracker: ReplyTracker::new(0, ReplyPolicy::AnyOk),
            callback: Mutex::new(None),
        }
    }

    pub fn with_extras(mut self, extras: impl Into<Vec<u8>>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_replicas(mut self, replicas: u8) -> Self {
        self.replicas = replicas;
        self.tracker = ReplyTracker::new(self.replicas, self.policy);
        self
    }

    pub fn with_policy(mut self, policy: ReplyPolicy) -> Self {
        self.policy = policy;
        self.tracker = ReplyTracker::new(self.replicas, self.policy);
        self
    }

    pub fn on_complete(self, callback: CompletionCallback) -> Self {
        *self.callback.lock().unwrap() = Some(callback);
        self
    }

    fn complete(&self, status: Status, value: Option<Vec<u8>>) {
        if let Some(callback) = self.callback.lock().unwrap().take() {
            callback(status, value);
        }
    }
}

impl Request for OpRequest {
    fn request_id(&self) -> u32 {
        self.opaque
    }

    fn key(&self) -> &[u8] {
        &self.key
    }

    fn replicas(&self) -> u8 {
        self.replicas
    }

    fn policy(&self) -> ReplyPolicy {
        self.policy
    }

    fn vbucket(&self) -> u16 {
        self.vbucket.load(Ordering::Acquire)
    }

    fn set_vbucket(&self, vbucket: u16) {
        self.vbucket.store(vbucket, Ordering::Release);
    }

    fn query_buffer(&self) -> Vec<u8> {
        RequestFrame {
            opcode: self.opcode,
            vbucket: self.vbucket(),
            opaque: self.opaque,
            cas: self.cas,
            extras: &self.extras,
            key: &self.key,
            value: &self.value,
        }
        .to_vec()
    }

    fn handle_response(&self, response: &Response<'_>) {
        if let TrackerAction::Fire(status) = self.tracker.on_event(response.header.status) {
            let value = if status.is_ok() {
                response.value.map(|v| v.to_vec())
            } else {
                None
            };
            self.complete(status, value);
        }
    }

    fn fail(&self) {
        if let TrackerAction::Fire(status) = self.tracker.on_event(Status::InternalError) {
            self.complete(status, None);
        }
    }
}

pub type StatCallback = Box<dyn FnOnce(Status, Vec<(Vec<u8>, Vec<u8>)>) + Send>;

/// A stat invocation. A server streams one row per statistic and ends
/// the stream with an empty-bodied terminator; rows accumulate here and
/// the callback fires on the terminator (or on failure).
pub struct StatRequest {
    key: Vec<u8>,
    opaque: u32,
    tracker: ReplyTracker,
    rows: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    callback: Mutex<Option<StatCallback>>,
}

impl StatRequest {
    pub fn new(opaque: u32) -> Self {
        Self {
            key: Vec::new(),
            opaque,
            tracker: ReplyTracker::new(0, ReplyPolicy::AnyOk),
            rows: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
        }
    }

    /// Restrict the stats to a named group, e.g. `items`.
    pub fn with_group(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = key.into();
        self
    }

    pub fn on_complete(self, callback: StatCallback) -> Self {
        *self.callback.lock().unwrap() = Some(callback);
        self
    }

    fn complete(&self, status: Status) {
        if let Some(callback) = self.callback.lock().unwrap().take() {
            let rows = std::mem::take(&mut *self.rows.lock().unwrap());
            callback(status, rows);
        }
    }
}

impl Request for StatRequest {
    fn request_id(&self) -> u32 {
        self.opaque
    }

    fn key(&self) -> &[u8] {
        &self.key
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
            opcode: Opcode::Stat,
            vbucket: 0,
            opaque: self.opaque,
            cas: 0,
            extras: &[],
            key: &self.key,
            value: &[],
        }
        .to_vec()
    }

    fn handle_response(&self, response: &Response<'_>) {
        // a row: remember it and wait for the terminator
        if response.header.status.is_ok() && response.header.total_body_len > 0 {
            let key = response.key.unwrap_or(&[]).to_vec();
            let value = response.value.unwrap_or(&[]).to_vec();
            self.rows.lock().unwrap().push((key, value));
            return;
        }

        if let TrackerAction::Fire(status) = self.tracker.on_event(response.header.status) {
            self.complete(status);
        }
    }

    fn fail(&self) {
        if let TrackerAction::Fire(status) = self.tracker.on_event(Status::InternalError) {
            self.complete(status);
        }
    }
}

/// The quit handshake used during shutdown. The callback fires when the
/// server acknowledges (or the transport fails), letting the owner
/// dispose the connection.
pub struct QuitRequest {
    opaque: u32,
    done: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl QuitRequest {
    pub fn new(done: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            opaque: next_internal_opaque(),
            done: Mutex::new(Some(done)),
        }
    }

    fn complete(&self) {
        if let Some(done) = self.done.lock().unwrap().take() {
            done();
        }
    }
}

impl Request for QuitRequest {
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
        let mut frame = RequestFrame::new(Opcode::Quit, &[]);
        frame.opaque = self.opaque;
        frame.to_vec()
    }

    fn handle_response(&self, _response: &Response<'_>) {
        self.complete();
    }

    fn fail(&self) {
        self.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn response(status: Status, value: Option<&[u8]>) -> ResponseHeader {
        ResponseHeader {
            opcode: Opcode::Get.into(),
            key_len: 0,
            extras_len: 0,
            data_type: 0,
            status,
            total_body_len: value.map(|v| v.len()).unwrap_or(0) as u32,
            opaque: 0,
            cas: 0,
        }
    }

    fn deliver(request: &dyn Request, status: Status, value: Option<&[u8]>) {
        let header = response(status, value);
        let response = Response {
            header,
            key: None,
            extras: None,
            value,
        };
        request.handle_response(&response);
    }

    type Outcomes = Arc<Mutex<Vec<(Status, Option<Vec<u8>>)>>>;

    fn recording_get(replicas: u8, policy: ReplyPolicy) -> (Arc<OpRequest>, Outcomes) {
        let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
        let recorded = outcomes.clone();
        let request = Arc::new(
            OpRequest::new(Opcode::Get, &b"Hello"[..], 0)
                .with_replicas(replicas)
                .with_policy(policy)
                .on_complete(Box::new(move |status, value| {
                    recorded.lock().unwrap().push((status, value));
                })),
        );
        (request, outcomes)
    }

    #[test]
    fn get_success() {
        let (request, outcomes) = recording_get(0, ReplyPolicy::AnyOk);

        let header = response(Status::NoError, Some(b"World"));
        request.handle_response(&Response {
            header,
            key: None,
            extras: Some(&[0xde, 0xad, 0xbe, 0xef]),
            value: Some(b"World"),
        });

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0], (Status::NoError, Some(b"World".to_vec())));
    }

    #[test]
    fn get_failure() {
        let (request, outcomes) = recording_get(0, ReplyPolicy::AnyOk);

        request.fail();

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0], (Status::InternalError, None));
    }

    #[test]
    fn redundant_all_succeed() {
        // three NoError replies: the callback fires once, on the first
        let (request, outcomes) = recording_get(2, ReplyPolicy::AnyOk);

        deliver(&*request, Status::NoError, Some(b"World1"));
        deliver(&*request, Status::NoError, Some(b"World2"));
        deliver(&*request, Status::NoError, Some(b"World3"));

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0], (Status::NoError, Some(b"World1".to_vec())));
    }

    #[test]
    fn redundant_all_fail_priority() {
        // a server that answered "missing" outranks a local failure
        let (request, outcomes) = recording_get(2, ReplyPolicy::AnyOk);

        deliver(&*request, Status::KeyNotFound, None);
        assert!(outcomes.lock().unwrap().is_empty());
        request.fail();
        assert!(outcomes.lock().unwrap().is_empty());
        deliver(&*request, Status::KeyNotFound, None);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0], (Status::KeyNotFound, None));
    }

    #[test]
    fn all_ok_first_failure_wins() {
        let (request, outcomes) = recording_get(2, ReplyPolicy::AllOk);

        deliver(&*request, Status::NoError, None);
        deliver(&*request, Status::KeyNotFound, None);
        deliver(&*request, Status::Busy, None);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0], (Status::KeyNotFound, None));
    }

    #[test]
    fn all_ok_local_failure() {
        let (request, outcomes) = recording_get(1, ReplyPolicy::AllOk);

        request.fail();
        deliver(&*request, Status::NoError, None);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0], (Status::InternalError, None));
    }

    #[test]
    fn all_ok_success() {
        let (request, outcomes) = recording_get(1, ReplyPolicy::AllOk);

        deliver(&*request, Status::NoError, None);
        deliver(&*request, Status::NoError, None);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, Status::NoError);
    }

    #[test]
    fn stat_rows_accumulate() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let recorded = outcomes.clone();
        let request = StatRequest::new(7).on_complete(Box::new(move |status, rows| {
            recorded.lock().unwrap().push((status, rows));
        }));

        // two rows then the empty terminator
        let header = ResponseHeader {
            opcode: Opcode::Stat.into(),
            key_len: 3,
            extras_len: 0,
            data_type: 0,
            status: Status::NoError,
            total_body_len: 8,
            opaque: 7,
            cas: 0,
        };
        request.handle_response(&Response {
            header,
            key: Some(b"pid"),
            extras: None,
            value: Some(b"12345"),
        });
        let header = ResponseHeader {
            key_len: 6,
            total_body_len: 9,
            ..header
        };
        request.handle_response(&Response {
            header,
            key: Some(b"uptime"),
            extras: None,
            value: Some(b"360"),
        });
        assert!(outcomes.lock().unwrap().is_empty());

        let terminator = ResponseHeader {
            key_len: 0,
            total_body_len: 0,
            ..header
        };
        request.handle_response(&Response {
            header: terminator,
            key: None,
            extras: None,
            value: None,
        });

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, Status::NoError);
        assert_eq!(
            outcomes[0].1,
            vec![
                (b"pid".to_vec(), b"12345".to_vec()),
                (b"uptime".to_vec(), b"360".to_vec()),
            ]
        );
    }
}
