//! Correlation engine for one connection.
//!
//! A single reader task owns the read half and the [`Framer`]; every complete
//! envelope is routed by message id to the request waiting for it. Writers
//! share the write half behind an async mutex, so whole envelopes never
//! interleave. Timeouts are applied on the caller side: a timed-out request
//! drops its pending entry and any late response is discarded by the reader.

use crate::connection::LdapStream;
use crate::controls::Control;
use crate::error::{LdapError, Result};
use crate::framer::Framer;
use crate::ldap_protocol::{
    encode_ldap_message, ExtendedRequest, LdapMessage, ProtocolOp, NOTICE_OF_DISCONNECTION_OID,
};
use crate::metrics::ClientMetrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustls_pki_types::ServerName;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";

const READ_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No transport attached yet.
    Idle = 0,
    Connected = 1,
    TlsUpgrading = 2,
    ConnectedSecure = 3,
    /// Unbind sent; no new requests.
    Closing = 4,
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Connected,
            2 => ConnectionState::TlsUpgrading,
            3 => ConnectionState::ConnectedSecure,
            4 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::ConnectedSecure)
    }
}

/// Message ids in `1..=i32::MAX`, wrapping back to 1.
#[derive(Debug)]
pub struct MessageIdGen {
    next: AtomicU32,
}

impl Default for MessageIdGen {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageIdGen {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: i32) -> Self {
        Self {
            next: AtomicU32::new(first.max(1) as u32),
        }
    }

    pub fn next_id(&self) -> i32 {
        let prev = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(if cur >= i32::MAX as u32 { 1 } else { cur + 1 })
            })
            .unwrap_or_else(|cur| cur);
        prev as i32
    }
}

/// The reader hands the read half back through this when StartTLS succeeds.
type Handoff = ReadHalf<LdapStream>;

enum Waiter {
    /// One final response.
    Single(oneshot::Sender<Result<LdapMessage>>),
    /// Entries, references and intermediates, then the final response.
    Stream(mpsc::UnboundedSender<Result<LdapMessage>>),
    StartTls(oneshot::Sender<(Result<LdapMessage>, Option<Handoff>)>),
    /// Completed successfully at teardown.
    Unbind(oneshot::Sender<()>),
}

impl Waiter {
    fn fail(self, err: LdapError) {
        match self {
            Waiter::Single(tx) => {
                let _ = tx.send(Err(err));
            }
            Waiter::Stream(tx) => {
                let _ = tx.send(Err(err));
            }
            Waiter::StartTls(tx) => {
                let _ = tx.send((Err(err), None));
            }
            Waiter::Unbind(tx) => {
                let _ = tx.send(());
            }
        }
    }
}

struct Pending {
    operation: &'static str,
    waiter: Waiter,
}

/// Insert `waiter` under the next id not already pending.
fn allocate(ids: &MessageIdGen, pending: &DashMap<i32, Pending>, operation: &'static str, waiter: Waiter) -> i32 {
    loop {
        let id = ids.next_id();
        match pending.entry(id) {
            Entry::Vacant(slot) => {
                slot.insert(Pending { operation, waiter });
                return id;
            }
            Entry::Occupied(_) => debug!("Message id {} still pending, skipping", id),
        }
    }
}

/// Removes a pending entry when the caller goes away before its response
/// arrives (future dropped, task aborted).
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: i32,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(inner: &'a Inner, id: i32) -> Self {
        Self { inner, id, armed: true }
    }

    /// The entry is now owned elsewhere (completed, or handed to a stream).
    fn disarm(mut self) -> i32 {
        self.armed = false;
        self.id
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.inner.pending.remove(&self.id).is_some() {
            debug!("Caller of message {} went away, dropping pending entry", self.id);
        }
    }
}

enum Flow {
    Continue,
    Disconnect,
    HandOff(oneshot::Sender<(Result<LdapMessage>, Option<Handoff>)>, LdapMessage),
}

struct Inner {
    ids: MessageIdGen,
    pending: DashMap<i32, Pending>,
    writer: Mutex<Option<WriteHalf<LdapStream>>>,
    /// Wakes writers blocked on the transport when the connection is torn down.
    closed: Notify,
    state: AtomicU8,
    reader: StdMutex<Option<JoinHandle<()>>>,
    max_message_size: usize,
    metrics: Arc<ClientMetrics>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        let prev = ConnectionState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if prev != state {
            debug!("Connection state {:?} -> {:?}", prev, state);
        }
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let ok = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            debug!("Connection state {:?} -> {:?}", from, to);
        }
        ok
    }

    fn check_open(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected | ConnectionState::ConnectedSecure => Ok(()),
            ConnectionState::Idle => Err(LdapError::InvalidState("not connected")),
            ConnectionState::TlsUpgrading => Err(LdapError::InvalidState("TLS upgrade in progress")),
            ConnectionState::Closing => Err(LdapError::InvalidState("connection is closing")),
            ConnectionState::Closed => Err(LdapError::ConnectionClosed),
        }
    }

    /// Id not currently pending, for requests that get no response.
    fn free_id(&self) -> i32 {
        loop {
            let id = self.ids.next_id();
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    async fn write(&self, message: &LdapMessage) -> Result<()> {
        let bytes = encode_ldap_message(message)?;
        let closed = self.closed.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();

        let mut guard = self.writer.lock().await;
        if self.state() == ConnectionState::Closed {
            guard.take();
            return Err(LdapError::ConnectionClosed);
        }
        let Some(writer) = guard.as_mut() else {
            return Err(LdapError::ConnectionClosed);
        };
        let written = tokio::select! {
            res = async {
                match writer.write_all(&bytes).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                }
            } => res.map_err(LdapError::Io),
            _ = closed.as_mut() => Err(LdapError::ConnectionClosed),
        };
        // Teardown cannot take the writer while we hold it
        if self.state() == ConnectionState::Closed {
            guard.take();
        }
        drop(guard);

        if let Err(e) = written {
            if let LdapError::Io(io) = &e {
                error!("Write of message {} failed: {}", message.message_id, io);
                self.teardown("write failed");
            }
            return Err(e);
        }
        debug!(
            "Sent {} message {} ({} bytes)",
            message.protocol_op.name(),
            message.message_id,
            bytes.len()
        );
        Ok(())
    }

    /// Fail every pending request and stop the reader. Idempotent.
    fn teardown(&self, reason: &str) {
        let prev = ConnectionState::from_u8(self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel));
        if prev != ConnectionState::Closed {
            info!("Connection closed: {}", reason);
        }
        let ids: Vec<i32> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                debug!("Failing pending {} message {}", pending.operation, id);
                pending.waiter.fail(LdapError::ConnectionClosed);
            }
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        self.closed.notify_waiters();
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }

    fn dispatch(&self, frame: Result<LdapMessage>) -> Flow {
        let message = match frame {
            Ok(message) => message,
            Err(LdapError::Decode {
                message_id: Some(id),
                tag,
                source,
            }) => {
                self.metrics.inc_decode_error();
                match self.pending.remove(&id) {
                    Some((_, pending)) => pending.waiter.fail(LdapError::Decode {
                        message_id: Some(id),
                        tag,
                        source,
                    }),
                    None => debug!("Undecodable envelope for unknown message {}", id),
                }
                return Flow::Continue;
            }
            Err(e) => {
                self.metrics.inc_decode_error();
                warn!("Undecodable envelope: {}", e);
                return Flow::Continue;
            }
        };

        let id = message.message_id;
        if id == 0 {
            return self.unsolicited(message);
        }

        if !message.protocol_op.is_terminal() {
            if let Some(pending) = self.pending.get(&id) {
                match &pending.waiter {
                    Waiter::Stream(tx) => {
                        if tx.send(Ok(message)).is_err() {
                            debug!("Receiver for message {} is gone", id);
                        }
                    }
                    _ => debug!(
                        "Ignoring {} for {} message {}",
                        message.protocol_op.name(),
                        pending.operation,
                        id
                    ),
                }
                return Flow::Continue;
            }
            self.metrics.inc_dropped_response();
            debug!("Dropping {} for unknown message {}", message.protocol_op.name(), id);
            return Flow::Continue;
        }

        let Some((_, pending)) = self.pending.remove(&id) else {
            self.metrics.inc_dropped_response();
            debug!("Dropping late {} for message {}", message.protocol_op.name(), id);
            return Flow::Continue;
        };
        debug!("Completed {} message {}", pending.operation, id);
        match pending.waiter {
            Waiter::Single(tx) => {
                let _ = tx.send(Ok(message));
            }
            Waiter::Stream(tx) => {
                let _ = tx.send(Ok(message));
            }
            Waiter::StartTls(tx) => {
                let accepted = matches!(
                    &message.protocol_op,
                    ProtocolOp::ExtendedResponse(r) if r.result.result_code == 0
                );
                if accepted {
                    return Flow::HandOff(tx, message);
                }
                let _ = tx.send((Ok(message), None));
            }
            Waiter::Unbind(tx) => {
                let _ = tx.send(());
            }
        }
        Flow::Continue
    }

    fn unsolicited(&self, message: LdapMessage) -> Flow {
        if let ProtocolOp::ExtendedResponse(resp) = &message.protocol_op {
            if resp.response_name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID) {
                warn!(
                    "Server sent notice of disconnection: {} {}",
                    resp.result.code(),
                    resp.result.diagnostic_message
                );
                return Flow::Disconnect;
            }
        }
        warn!("Ignoring unsolicited {} with message id 0", message.protocol_op.name());
        Flow::Continue
    }

    fn record<T>(&self, operation: &'static str, started: Instant, result: &Result<T>) {
        match result {
            Ok(_) => self.metrics.observe_duration(operation, started.elapsed()),
            Err(e) => self.record_failure(operation, started, e),
        }
    }

    /// Timeouts are counted separately when they happen.
    fn record_failure(&self, operation: &'static str, started: Instant, err: &LdapError) {
        self.metrics.observe_duration(operation, started.elapsed());
        if !matches!(err, LdapError::Timeout { .. }) {
            self.metrics.inc_error(operation);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }
}

async fn read_loop(session: Weak<Inner>, mut read_half: ReadHalf<LdapStream>, mut framer: Framer) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = read_half.read(&mut buf).await;
        let Some(inner) = session.upgrade() else {
            debug!("Session dropped, reader exiting");
            return;
        };
        let n = match read {
            Ok(0) => {
                inner.teardown("closed by server");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                if inner.state().is_open() {
                    error!("Read error: {}", e);
                } else {
                    debug!("Read error while closing: {}", e);
                }
                inner.teardown("read failed");
                return;
            }
        };
        let frames = match framer.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                error!("Unrecoverable framing error: {}", e);
                inner.metrics.inc_decode_error();
                inner.teardown("framing error");
                return;
            }
        };
        let mut frames = frames.into_iter();
        while let Some(frame) = frames.next() {
            match inner.dispatch(frame) {
                Flow::Continue => {}
                Flow::Disconnect => {
                    inner.teardown("notice of disconnection");
                    return;
                }
                Flow::HandOff(tx, message) => {
                    let leftover = frames.len() + framer.buffered();
                    if leftover > 0 {
                        warn!("Discarding data received after StartTLS response ({} frames/bytes)", leftover);
                    }
                    if tx.send((Ok(message), Some(read_half))).is_err() {
                        inner.teardown("StartTLS caller went away");
                    }
                    return;
                }
            }
        }
    }
}

/// Handle to one multiplexed connection. Clones share the connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Take ownership of `stream` and start the reader task. Must be called
    /// inside a tokio runtime.
    pub fn start(stream: LdapStream, metrics: Arc<ClientMetrics>, max_message_size: usize) -> Session {
        let secure = stream.is_secure();
        let (read_half, write_half) = tokio::io::split(stream);
        let inner = Arc::new(Inner {
            ids: MessageIdGen::new(),
            pending: DashMap::new(),
            writer: Mutex::new(Some(write_half)),
            closed: Notify::new(),
            state: AtomicU8::new(ConnectionState::Idle as u8),
            reader: StdMutex::new(None),
            max_message_size,
            metrics,
        });
        inner.metrics.inc_connections();
        inner.set_state(if secure {
            ConnectionState::ConnectedSecure
        } else {
            ConnectionState::Connected
        });
        let session = Session { inner };
        session.spawn_reader(read_half);
        session
    }

    fn spawn_reader(&self, read_half: ReadHalf<LdapStream>) {
        let framer = Framer::with_max_message_size(self.inner.max_message_size);
        let handle = tokio::spawn(read_loop(Arc::downgrade(&self.inner), read_half, framer));
        if let Ok(mut slot) = self.inner.reader.lock() {
            *slot = Some(handle);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.inner.metrics
    }

    /// Requests still waiting for their final response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    async fn send(&self, op: ProtocolOp, controls: Vec<Control>, waiter: Waiter) -> Result<PendingGuard<'_>> {
        self.inner.check_open()?;
        let id = allocate(&self.inner.ids, &self.inner.pending, op.name(), waiter);
        let guard = PendingGuard::new(&self.inner, id);
        let message = LdapMessage::new(id, op).with_controls(controls);
        self.inner.write(&message).await?;
        Ok(guard)
    }

    /// Send a request and wait for its single final response.
    pub async fn request(&self, op: ProtocolOp, controls: Vec<Control>, timeout: Option<Duration>) -> Result<LdapMessage> {
        let operation = op.name();
        let started = Instant::now();
        self.inner.metrics.inc_request(operation);
        let (tx, rx) = oneshot::channel();
        let result = match self.send(op, controls, Waiter::Single(tx)).await {
            Ok(guard) => self.wait(guard, operation, rx, timeout).await.and_then(|response| response),
            Err(e) => Err(e),
        };
        self.inner.record(operation, started, &result);
        result
    }

    async fn wait<T>(
        &self,
        guard: PendingGuard<'_>,
        operation: &'static str,
        rx: oneshot::Receiver<T>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let id = guard.id;
        let received = match timeout {
            Some(after) => match tokio::time::timeout(after, rx).await {
                Ok(received) => received,
                Err(_) => {
                    drop(guard);
                    self.inner.metrics.inc_timeout(operation);
                    debug!("{} message {} timed out after {:?}", operation, id, after);
                    return Err(LdapError::Timeout { message_id: id, after });
                }
            },
            None => rx.await,
        };
        guard.disarm();
        received.map_err(|_| LdapError::ConnectionClosed)
    }

    /// Send a request whose responses arrive as a sequence (search).
    pub async fn request_stream(
        &self,
        op: ProtocolOp,
        controls: Vec<Control>,
        timeout: Option<Duration>,
    ) -> Result<ResponseStream> {
        let operation = op.name();
        let started = Instant::now();
        self.inner.metrics.inc_request(operation);
        let (tx, rx) = mpsc::unbounded_channel();
        let message_id = match self.send(op, controls, Waiter::Stream(tx)).await {
            Ok(guard) => guard.disarm(),
            Err(e) => {
                self.inner.record_failure(operation, started, &e);
                return Err(e);
            }
        };
        Ok(ResponseStream {
            session: self.clone(),
            message_id,
            operation,
            rx,
            deadline: timeout.map(|after| (tokio::time::Instant::now() + after, after)),
            started,
            done: false,
        })
    }

    /// Ask the server to abandon `target` and resolve its waiter with
    /// `Abandoned`. Abandon itself gets no response.
    pub async fn abandon(&self, target: i32, controls: Vec<Control>) -> Result<()> {
        self.inner.check_open()?;
        self.inner.metrics.inc_request("abandon");
        let removed = self.inner.pending.remove_if(&target, |_, p| {
            matches!(p.waiter, Waiter::Single(_) | Waiter::Stream(_))
        });
        match removed {
            Some((_, pending)) => {
                debug!("Abandoning {} message {}", pending.operation, target);
                pending.waiter.fail(LdapError::Abandoned { message_id: target });
            }
            None => debug!("Abandon of message {} which is not pending", target),
        }
        self.inner.metrics.inc_abandon();
        let id = self.inner.free_id();
        let message = LdapMessage::new(id, ProtocolOp::AbandonRequest(target)).with_controls(controls);
        self.inner.write(&message).await
    }

    /// Send unbind, close the transport and fail whatever is still pending.
    pub async fn unbind(&self, controls: Vec<Control>) -> Result<()> {
        loop {
            let state = self.inner.state();
            match state {
                ConnectionState::Closing | ConnectionState::Closed => return Ok(()),
                ConnectionState::TlsUpgrading => return Err(LdapError::InvalidState("TLS upgrade in progress")),
                _ => {}
            }
            if self.inner.transition(state, ConnectionState::Closing) {
                break;
            }
        }
        self.inner.metrics.inc_request("unbind");
        let (tx, rx) = oneshot::channel();
        let id = allocate(&self.inner.ids, &self.inner.pending, "unbind", Waiter::Unbind(tx));
        let message = LdapMessage::new(id, ProtocolOp::UnbindRequest).with_controls(controls);
        let written = self.inner.write(&message).await;
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown after unbind failed: {}", e);
            }
        }
        self.inner.teardown("unbind");
        let _ = rx.await;
        info!("Unbound (message {})", id);
        written
    }

    /// StartTLS: send the extended request, take the read half back from the
    /// reader, run the handshake over the reassembled stream and restart
    /// reading over TLS.
    pub async fn start_tls(
        &self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
        controls: Vec<Control>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        match self.inner.state() {
            ConnectionState::Connected => {}
            ConnectionState::ConnectedSecure => {
                return Err(LdapError::InvalidState("connection is already encrypted"))
            }
            _ => return self.inner.check_open(),
        }
        if !self.inner.transition(ConnectionState::Connected, ConnectionState::TlsUpgrading) {
            return Err(LdapError::InvalidState("connection state changed"));
        }
        // Checked after the transition so no request can slip in between
        if !self.inner.pending.is_empty() {
            self.inner
                .transition(ConnectionState::TlsUpgrading, ConnectionState::Connected);
            return Err(LdapError::InvalidState("StartTLS with operations outstanding"));
        }

        let operation = "extended";
        let started = Instant::now();
        self.inner.metrics.inc_request(operation);
        let result = self.negotiate_tls(connector, server_name, controls, timeout).await;
        if result.is_err() {
            self.inner
                .transition(ConnectionState::TlsUpgrading, ConnectionState::Connected);
        }
        self.inner.record(operation, started, &result);
        result
    }

    async fn negotiate_tls(
        &self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
        controls: Vec<Control>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let id = allocate(&self.inner.ids, &self.inner.pending, "start_tls", Waiter::StartTls(tx));
        let guard = PendingGuard::new(&self.inner, id);
        let request = ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: START_TLS_OID.to_string(),
            request_value: None,
        });
        let message = LdapMessage::new(id, request).with_controls(controls);
        self.inner.write(&message).await?;

        let (response, handoff) = self.wait(guard, "extended", rx, timeout).await?;
        let response = response?;
        let Some(read_half) = handoff else {
            return Err(match response.protocol_op.result() {
                Some(result) if response.protocol_op.tag() == crate::ldap_protocol::LDAP_TAG_EXTENDED_RESPONSE => {
                    result.to_error()
                }
                _ => LdapError::UnexpectedResponse {
                    operation: "start_tls",
                    got: response.protocol_op.tag(),
                },
            });
        };

        let write_half = self.inner.writer.lock().await.take();
        let Some(write_half) = write_half else {
            self.inner.teardown("writer lost during StartTLS");
            return Err(LdapError::ConnectionClosed);
        };
        let stream = read_half.unsplit(write_half);
        info!("StartTLS accepted, starting handshake");
        let stream = match stream.upgrade(connector, server_name).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("StartTLS handshake failed: {}", e);
                self.inner.teardown("TLS handshake failed");
                return Err(e);
            }
        };
        let (read_half, write_half) = tokio::io::split(stream);
        *self.inner.writer.lock().await = Some(write_half);
        if !self
            .inner
            .transition(ConnectionState::TlsUpgrading, ConnectionState::ConnectedSecure)
        {
            return Err(LdapError::ConnectionClosed);
        }
        self.spawn_reader(read_half);
        info!("Connection upgraded to TLS");
        Ok(())
    }
}

/// Responses to one streaming request, in arrival order, ending with the
/// final response.
pub struct ResponseStream {
    session: Session,
    message_id: i32,
    operation: &'static str,
    rx: mpsc::UnboundedReceiver<Result<LdapMessage>>,
    deadline: Option<(tokio::time::Instant, Duration)>,
    started: Instant,
    done: bool,
}

impl ResponseStream {
    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    /// `None` once the final response (or an error) has been returned.
    pub async fn next(&mut self) -> Option<Result<LdapMessage>> {
        if self.done {
            return None;
        }
        let received = match self.deadline {
            Some((at, after)) => match tokio::time::timeout_at(at, self.rx.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    self.done = true;
                    let inner = &self.session.inner;
                    inner.pending.remove(&self.message_id);
                    inner.metrics.inc_timeout(self.operation);
                    debug!("{} message {} timed out after {:?}", self.operation, self.message_id, after);
                    return Some(Err(LdapError::Timeout {
                        message_id: self.message_id,
                        after,
                    }));
                }
            },
            None => self.rx.recv().await,
        };
        let item = match received {
            Some(Ok(message)) => {
                if !message.protocol_op.is_terminal() {
                    return Some(Ok(message));
                }
                Ok(message)
            }
            Some(Err(e)) => Err(e),
            None => Err(LdapError::ConnectionClosed),
        };
        self.done = true;
        self.session.inner.record(self.operation, self.started, &item);
        Some(item)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if !self.done {
            self.session.inner.pending.remove(&self.message_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::framer::DEFAULT_MAX_MESSAGE_SIZE;
    use crate::ldap_protocol::{
        AddRequest, Attribute, DelRequest, ExtendedResponse, LdapResult, SearchRequest, SearchResultEntry, SearchScope,
    };
    use crate::test_server::{pair, FakeServer};

    fn start() -> (Session, FakeServer) {
        let (stream, server) = pair();
        let session = Session::start(stream, Arc::new(ClientMetrics::new()), DEFAULT_MAX_MESSAGE_SIZE);
        (session, server)
    }

    fn delete(dn: &str) -> ProtocolOp {
        ProtocolOp::DelRequest(DelRequest { entry: dn.to_string() })
    }

    fn search() -> ProtocolOp {
        ProtocolOp::SearchRequest(SearchRequest::new(
            "dc=example,dc=com",
            SearchScope::WholeSubtree,
            Filter::presence("objectClass"),
        ))
    }

    #[test]
    fn test_id_generator_wraps() {
        let ids = MessageIdGen::starting_at(i32::MAX - 1);
        assert_eq!(ids.next_id(), i32::MAX - 1);
        assert_eq!(ids.next_id(), i32::MAX);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn test_allocate_skips_pending_ids() {
        let ids = MessageIdGen::starting_at(i32::MAX);
        let pending = DashMap::new();
        let (tx, _rx) = oneshot::channel();
        pending.insert(1, Pending { operation: "search", waiter: Waiter::Single(tx) });
        let (tx, _rx) = oneshot::channel();
        assert_eq!(allocate(&ids, &pending, "bind", Waiter::Single(tx)), i32::MAX);
        let (tx, _rx) = oneshot::channel();
        assert_eq!(allocate(&ids, &pending, "bind", Waiter::Single(tx)), 2);
        assert_eq!(pending.len(), 3);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_correlated() {
        let (session, mut server) = start();
        let s1 = session.clone();
        let s2 = session.clone();
        let first = tokio::spawn(async move { s1.request(delete("cn=a"), vec![], None).await });
        let second = tokio::spawn(async move { s2.request(delete("cn=b"), vec![], None).await });

        let a = server.recv().await.unwrap();
        let b = server.recv().await.unwrap();
        assert_ne!(a.message_id, b.message_id);
        // Answer in reverse order with distinguishable diagnostics
        for req in [&b, &a] {
            let ProtocolOp::DelRequest(del) = &req.protocol_op else {
                panic!("expected delete, got {:?}", req.protocol_op);
            };
            let result = LdapResult::with_code(0, &del.entry);
            server.reply(req.message_id, ProtocolOp::DelResponse(result)).await;
        }

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.protocol_op.result().unwrap().diagnostic_message, "cn=a");
        assert_eq!(second.protocol_op.result().unwrap().diagnostic_message, "cn=b");
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_dropped() {
        let (session, mut server) = start();
        let caller = session.clone();
        let slow = tokio::spawn(async move {
            caller
                .request(delete("cn=slow"), vec![], Some(Duration::from_millis(50)))
                .await
        });
        let req = server.recv().await.unwrap();
        let err = slow.await.unwrap().unwrap_err();
        assert!(matches!(err, LdapError::Timeout { message_id, .. } if message_id == req.message_id));
        assert_eq!(session.pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        server.reply(req.message_id, ProtocolOp::DelResponse(LdapResult::success())).await;

        // The connection keeps working after the stale response
        let caller = session.clone();
        let next = tokio::spawn(async move { caller.request(delete("cn=next"), vec![], None).await });
        let req2 = server.recv().await.unwrap();
        server.reply(req2.message_id, ProtocolOp::DelResponse(LdapResult::success())).await;
        assert!(next.await.unwrap().is_ok());

        let metrics = session.metrics();
        assert_eq!(metrics.timeouts("delete"), 1);
        assert_eq!(metrics.dropped_responses.load(Ordering::Relaxed), 1);
        assert!(session.state().is_open());
    }

    #[tokio::test]
    async fn test_stream_delivers_entries_then_done() {
        let (session, mut server) = start();
        let mut stream = session.request_stream(search(), vec![], None).await.unwrap();
        let req = server.recv().await.unwrap();
        assert_eq!(req.message_id, stream.message_id());
        for i in 0..3 {
            let entry = SearchResultEntry {
                object_name: format!("cn=u{},dc=example,dc=com", i),
                attributes: vec![Attribute::new("cn", [format!("u{}", i)])],
            };
            server.reply(req.message_id, ProtocolOp::SearchResultEntry(entry)).await;
        }
        server
            .reply(req.message_id, ProtocolOp::SearchResultDone(LdapResult::success()))
            .await;

        let mut entries = 0;
        while let Some(item) = stream.next().await {
            match item.unwrap().protocol_op {
                ProtocolOp::SearchResultEntry(_) => entries += 1,
                ProtocolOp::SearchResultDone(_) => {}
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(entries, 3);
        assert!(stream.next().await.is_none());
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandon_resolves_waiter() {
        let (session, mut server) = start();
        let mut stream = session.request_stream(search(), vec![], None).await.unwrap();
        let req = server.recv().await.unwrap();
        session.abandon(stream.message_id(), vec![]).await.unwrap();

        let abandon = server.recv().await.unwrap();
        assert_eq!(abandon.protocol_op, ProtocolOp::AbandonRequest(req.message_id));
        assert_ne!(abandon.message_id, req.message_id);
        assert!(matches!(
            stream.next().await,
            Some(Err(LdapError::Abandoned { message_id })) if message_id == req.message_id
        ));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.metrics().abandons.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unbind_closes_and_fails_pending() {
        let (session, mut server) = start();
        let caller = session.clone();
        let outstanding = tokio::spawn(async move { caller.request(delete("cn=x"), vec![], None).await });
        let _req = server.recv().await.unwrap();

        session.unbind(vec![]).await.unwrap();
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(matches!(outstanding.await.unwrap(), Err(LdapError::ConnectionClosed)));

        let unbind = server.recv().await.unwrap();
        assert_eq!(unbind.protocol_op, ProtocolOp::UnbindRequest);
        assert!(server.recv().await.is_none());

        // Further requests fail fast
        assert!(matches!(
            session.request(delete("cn=y"), vec![], None).await,
            Err(LdapError::ConnectionClosed)
        ));
        assert!(session.unbind(vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn test_server_close_fails_pending() {
        let (session, mut server) = start();
        let caller = session.clone();
        let outstanding = tokio::spawn(async move { caller.request(delete("cn=x"), vec![], None).await });
        let _req = server.recv().await.unwrap();
        drop(server);
        assert!(matches!(outstanding.await.unwrap(), Err(LdapError::ConnectionClosed)));
        assert_eq!(session.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_notice_of_disconnection_tears_down() {
        let (session, mut server) = start();
        let caller = session.clone();
        let outstanding = tokio::spawn(async move { caller.request(delete("cn=x"), vec![], None).await });
        let _req = server.recv().await.unwrap();
        let notice = ProtocolOp::ExtendedResponse(ExtendedResponse {
            result: LdapResult::with_code(52, "going down"),
            response_name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
            response_value: None,
        });
        server.reply(0, notice).await;
        assert!(matches!(outstanding.await.unwrap(), Err(LdapError::ConnectionClosed)));
        assert_eq!(session.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_undecodable_response_fails_only_its_request() {
        let (session, mut server) = start();
        let caller = session.clone();
        let broken = tokio::spawn(async move { caller.request(delete("cn=x"), vec![], None).await });
        let req = server.recv().await.unwrap();
        // Well framed envelope for the request id with an unknown operation tag
        let id = req.message_id as u8;
        server.send_raw(&[0x30, 0x05, 0x02, 0x01, id, 0x7A, 0x00]).await;
        assert!(matches!(
            broken.await.unwrap(),
            Err(LdapError::Decode { message_id: Some(m), .. }) if m == req.message_id
        ));
        assert!(session.state().is_open());
        assert_eq!(session.metrics().decode_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_start_tls_refused_keeps_plain_connection() {
        let (session, mut server) = start();
        let tls = crate::config::TlsConfig {
            skip_verify: true,
            ..Default::default()
        };
        let (connector, name) = crate::connection::tls_setup("localhost", Some(&tls)).unwrap();
        let caller = session.clone();
        let upgrade = tokio::spawn(async move { caller.start_tls(&connector, name, vec![], None).await });
        let req = server.recv().await.unwrap();
        let ProtocolOp::ExtendedRequest(ext) = &req.protocol_op else {
            panic!("expected extended request");
        };
        assert_eq!(ext.request_name, START_TLS_OID);
        let refusal = ProtocolOp::ExtendedResponse(ExtendedResponse {
            result: LdapResult::with_code(2, "no TLS here"),
            response_name: None,
            response_value: None,
        });
        server.reply(req.message_id, refusal).await;
        let err = upgrade.await.unwrap().unwrap_err();
        assert_eq!(err.result_code(), Some(crate::error::ResultCode::ProtocolError));
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_cancelled_caller_releases_pending_entry() {
        let (session, mut server) = start();
        let caller = session.clone();
        let task = tokio::spawn(async move { caller.request(delete("cn=x"), vec![], None).await });
        let req = server.recv().await.unwrap();
        assert_eq!(session.pending_count(), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(session.pending_count(), 0);

        // The answer to the cancelled request is stale now
        server.reply(req.message_id, ProtocolOp::DelResponse(LdapResult::success())).await;
        let caller = session.clone();
        let next = tokio::spawn(async move { caller.request(delete("cn=y"), vec![], None).await });
        let req2 = server.recv().await.unwrap();
        server.reply(req2.message_id, ProtocolOp::DelResponse(LdapResult::success())).await;
        assert!(next.await.unwrap().is_ok());
        assert_eq!(session.metrics().dropped_responses.load(Ordering::Relaxed), 1);
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_releases_writer_blocked_in_send() {
        let (session, mut server) = start();
        // Larger than the pipe, and the server does not read it
        let big = ProtocolOp::AddRequest(AddRequest {
            entry: "cn=big,dc=example,dc=com".to_string(),
            attributes: vec![Attribute::new("description", ["x".repeat(256 * 1024)])],
        });
        let caller = session.clone();
        let blocked = tokio::spawn(async move { caller.request(big, vec![], None).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        let notice = ProtocolOp::ExtendedResponse(ExtendedResponse {
            result: LdapResult::with_code(52, "going down"),
            response_name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
            response_value: None,
        });
        server.reply(0, notice).await;

        let result = tokio::time::timeout(Duration::from_secs(2), blocked).await.unwrap();
        assert!(matches!(result.unwrap(), Err(LdapError::ConnectionClosed)));
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(session.pending_count(), 0);
        // Both halves are gone, so the server sees end of stream
        let eof = tokio::time::timeout(Duration::from_secs(2), server.recv()).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_abandoned_search_bursts_do_not_disturb_others() {
        let (session, mut server) = start();
        let mut streams = Vec::new();
        for _ in 0..3 {
            streams.push(session.request_stream(search(), vec![], None).await.unwrap());
        }
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(server.recv().await.unwrap().message_id);
        }
        assert_eq!(ids, streams.iter().map(|s| s.message_id()).collect::<Vec<_>>());

        session.abandon(ids[1], vec![]).await.unwrap();
        let abandon = server.recv().await.unwrap();
        assert_eq!(abandon.protocol_op, ProtocolOp::AbandonRequest(ids[1]));

        // The server had already started answering the abandoned search
        for round in 0..2 {
            for (n, id) in ids.iter().enumerate().rev() {
                let entry = SearchResultEntry {
                    object_name: format!("cn=s{}-{},dc=example,dc=com", n, round),
                    attributes: vec![],
                };
                server.reply(*id, ProtocolOp::SearchResultEntry(entry)).await;
                let uri = format!("ldap://other/s{}", n);
                server.reply(*id, ProtocolOp::SearchResultReference(vec![uri])).await;
            }
        }
        for id in ids.iter().rev() {
            server.reply(*id, ProtocolOp::SearchResultDone(LdapResult::success())).await;
        }

        for n in [0, 2] {
            let stream = &mut streams[n];
            let mut entries = 0;
            let mut references = 0;
            let mut done = false;
            while let Some(item) = stream.next().await {
                match item.unwrap().protocol_op {
                    ProtocolOp::SearchResultEntry(e) => {
                        assert!(e.object_name.starts_with(&format!("cn=s{}-", n)));
                        entries += 1;
                    }
                    ProtocolOp::SearchResultReference(uris) => {
                        assert_eq!(uris, vec![format!("ldap://other/s{}", n)]);
                        references += 1;
                    }
                    ProtocolOp::SearchResultDone(_) => done = true,
                    other => panic!("unexpected {:?}", other),
                }
            }
            assert_eq!((entries, references, done), (2, 2, true));
        }
        let abandoned = &mut streams[1];
        assert!(matches!(
            abandoned.next().await,
            Some(Err(LdapError::Abandoned { message_id })) if message_id == ids[1]
        ));
        assert!(abandoned.next().await.is_none());

        // Two entries, two references and the done for the abandoned id
        assert_eq!(session.metrics().dropped_responses.load(Ordering::Relaxed), 5);
        assert_eq!(session.pending_count(), 0);
        assert!(session.state().is_open());
    }

    #[tokio::test]
    async fn test_concurrent_unbind_sends_once() {
        let (session, mut server) = start();
        let (a, b) = tokio::join!(session.unbind(vec![]), session.unbind(vec![]));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(server.recv().await.unwrap().protocol_op, ProtocolOp::UnbindRequest);
        assert!(server.recv().await.is_none());
        assert_eq!(session.metrics().requests("unbind"), 1);
    }

    #[tokio::test]
    async fn test_start_tls_with_outstanding_request_is_refused() {
        let (session, mut server) = start();
        let caller = session.clone();
        let outstanding = tokio::spawn(async move { caller.request(delete("cn=x"), vec![], None).await });
        let req = server.recv().await.unwrap();

        let tls = crate::config::TlsConfig {
            skip_verify: true,
            ..Default::default()
        };
        let (connector, name) = crate::connection::tls_setup("localhost", Some(&tls)).unwrap();
        let err = session.start_tls(&connector, name, vec![], None).await.unwrap_err();
        assert!(matches!(err, LdapError::InvalidState(_)));
        assert_eq!(session.state(), ConnectionState::Connected);

        server.reply(req.message_id, ProtocolOp::DelResponse(LdapResult::success())).await;
        assert!(outstanding.await.unwrap().is_ok());
    }
}
