//! Scripted transport for session and runner tests.

use super::{Admission, Result, Transport};
use crate::config::TransportConfig;
use crate::http::HttpMessage;
use crate::session::HttpServerSession;
use crate::storage::StoreError;
use async_trait::async_trait;
use axum::http::StatusCode;
use flod_types::JsonRpcMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) struct MockTransport {
    config: TransportConfig,
    inbound: Mutex<VecDeque<JsonRpcMessage>>,
    written: Mutex<Vec<JsonRpcMessage>>,
    calls: Mutex<Vec<&'static str>>,
    reads: AtomicUsize,
    started: AtomicBool,
    sse: AtomicBool,
    fail_reads: AtomicBool,
    fail_stop: AtomicBool,
    disconnected: AtomicBool,
    stream_closes: AtomicUsize,
    /// Session whose state `stop` records
    pub watched: Mutex<Option<Arc<HttpServerSession>>>,
    pub closed_at_stop: Mutex<Option<bool>>,
}

impl MockTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            inbound: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            sse: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            stream_closes: AtomicUsize::new(0),
            watched: Mutex::new(None),
            closed_at_stop: Mutex::new(None),
        }
    }

    pub fn with_messages(self, messages: Vec<JsonRpcMessage>) -> Self {
        self.inbound.lock().extend(messages);
        self
    }

    pub fn requesting_sse(self) -> Self {
        self.sse.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_reads(self) -> Self {
        self.fail_reads.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_stop(self) -> Self {
        self.fail_stop.store(true, Ordering::SeqCst);
        self
    }

    /// Simulate the SSE client going away.
    pub fn disconnect_client(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// How often the session ended the stream.
    pub fn stream_closes(&self) -> usize {
        self.stream_closes.load(Ordering::SeqCst)
    }

    pub fn push(&self, message: JsonRpcMessage) {
        self.inbound.lock().push_back(message);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<JsonRpcMessage> {
        self.written.lock().clone()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> Result<()> {
        self.calls.lock().push("start");
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.calls.lock().push("stop");
        let closed = self.watched.lock().as_ref().map(|s| s.is_closed());
        *self.closed_at_stop.lock() = closed;
        self.started.store(false, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::other("stop failed")).into());
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn read_message(&self) -> Result<Option<JsonRpcMessage>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::other("read failed")).into());
        }
        Ok(self.inbound.lock().pop_front())
    }

    async fn write_message(&self, message: JsonRpcMessage) -> Result<()> {
        self.written.lock().push(message);
        Ok(())
    }

    async fn enqueue(&self, messages: Vec<JsonRpcMessage>) -> Result<()> {
        self.inbound.lock().extend(messages);
        Ok(())
    }

    async fn pending(&self) -> Result<usize> {
        Ok(self.inbound.lock().len())
    }

    async fn receive_request(&self, _request: HttpMessage) -> Result<Admission> {
        self.calls.lock().push("receive");
        Ok(Admission::Accepted)
    }

    fn take_response(&self) -> HttpMessage {
        let messages = std::mem::take(&mut *self.written.lock());
        if messages.is_empty() {
            HttpMessage::response(StatusCode::ACCEPTED)
        } else {
            HttpMessage::json(StatusCode::OK, &messages)
        }
    }

    fn open_stream(&self) -> HttpMessage {
        HttpMessage::response(StatusCode::OK).with_header("content-type", "text/event-stream")
    }

    fn close_stream(&self) {
        self.stream_closes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_stream_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn client_requested_sse(&self) -> bool {
        self.sse.load(Ordering::SeqCst)
    }

    fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn session_id(&self) -> Option<String> {
        Some("mock".to_string())
    }
}
