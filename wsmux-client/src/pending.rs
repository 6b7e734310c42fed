//! In-flight request tracking.
//!
//! Every outbound request gets an entry keyed by its correlation id. The entry
//! collects the response frame and the body chunks, in whatever order they
//! arrive, and completes the caller once the body is whole. Each entry owns a
//! timer task that evicts it when the negotiated timeout passes.

use crate::error::ClientError;
use crate::http::{FetchRequest, HttpResponse};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use wsmux_protocol::frame::usable_payload;
use wsmux_protocol::{ChunkFrame, CorrelationId, ErrorFrame, ResponseFrame, MAX_CHUNKS};

type Completion = oneshot::Sender<Result<HttpResponse, ClientError>>;

struct Entry {
    method: String,
    url: String,
    tx: Completion,
    response: Option<ResponseFrame>,
    /// Body slots, sized once the response frame fixes the chunk count.
    slots: Vec<Option<Bytes>>,
    received: usize,
    /// Chunks that arrived before the response frame.
    early: HashMap<u16, Bytes>,
    timer: Option<JoinHandle<()>>,
}

/// What to do with an entry after a frame was applied to it.
enum Step {
    Wait,
    Complete,
    OutOfRange { index: u16, expected: usize },
    TooLarge { declared: usize },
    Oversized { index: u16, len: usize },
}

/// Entries plus whether the connection behind them is gone.
#[derive(Default)]
struct Table {
    entries: HashMap<CorrelationId, Entry>,
    closed: bool,
}

impl Entry {
    fn new(request: &FetchRequest, tx: Completion) -> Self {
        Self {
            method: request.method.clone(),
            url: request.url.clone(),
            tx,
            response: None,
            slots: Vec::new(),
            received: 0,
            early: HashMap::new(),
            timer: None,
        }
    }

    fn expected(&self) -> usize {
        self.slots.len()
    }

    fn is_complete(&self) -> bool {
        self.response.is_some() && self.received == self.expected()
    }

    /// Stores a payload, ignoring repeats of an already filled slot.
    fn fill(&mut self, index: u16, payload: Bytes) -> Step {
        let expected = self.expected();
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return Step::OutOfRange { index, expected };
        };
        if slot.is_some() {
            trace!(index, "duplicate chunk ignored");
        } else {
            *slot = Some(payload);
            self.received += 1;
        }
        if self.is_complete() {
            Step::Complete
        } else {
            Step::Wait
        }
    }

    fn attach(&mut self, frame: ResponseFrame, usable: usize) -> Step {
        let declared = frame.declared_length();
        let expected = declared.div_ceil(usable);
        if expected > MAX_CHUNKS {
            return Step::TooLarge { declared };
        }

        self.slots = vec![None; expected];
        self.response = Some(frame);

        let early = std::mem::take(&mut self.early);
        for (index, payload) in early {
            if let step @ Step::OutOfRange { .. } = self.fill(index, payload) {
                return step;
            }
        }

        if self.is_complete() {
            Step::Complete
        } else {
            Step::Wait
        }
    }

    fn finish(mut self, result: Result<HttpResponse, ClientError>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // The caller may have stopped waiting.
        let _ = self.tx.send(result);
    }

    /// Concatenates the slots in index order and completes the caller.
    fn complete(mut self, id: CorrelationId) {
        let Some(frame) = self.response.take() else {
            return self.finish(Err(ClientError::MalformedFrame(
                "completed without a response frame".to_string(),
            )));
        };

        let declared = frame.declared_length();
        let mut body = BytesMut::with_capacity(declared);
        for payload in self.slots.iter().flatten() {
            body.extend_from_slice(payload);
        }

        if body.len() != declared {
            warn!(
                %id,
                declared,
                received = body.len(),
                "response body length does not match declaration"
            );
            return self.finish(Err(ClientError::MalformedFrame(format!(
                "response for {} declared {} bytes but carried {}",
                id,
                declared,
                body.len()
            ))));
        }

        debug!(
            %id,
            method = %self.method,
            url = %self.url,
            status = frame.status,
            body_len = declared,
            "request complete"
        );
        let response = HttpResponse::from_frame(frame, body.freeze());
        self.finish(Ok(response));
    }
}

/// Waits for one request's terminal state.
#[derive(Debug)]
pub struct PendingHandle {
    id: CorrelationId,
    rx: oneshot::Receiver<Result<HttpResponse, ClientError>>,
}

impl PendingHandle {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Resolves when the entry completes, fails or times out.
    pub async fn wait(self) -> Result<HttpResponse, ClientError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }
}

/// Table of in-flight requests.
///
/// Cloning shares the table. The lock is never held across an `.await`, and
/// completions are delivered after it is released.
#[derive(Clone)]
pub struct PendingTable {
    inner: Arc<Mutex<Table>>,
    usable: usize,
}

impl PendingTable {
    /// Creates a table for chunks of at most `max_packet_size` bytes.
    pub fn new(max_packet_size: usize) -> Result<Self, ClientError> {
        Ok(Self {
            inner: Arc::new(Mutex::new(Table::default())),
            usable: usable_payload(max_packet_size)?,
        })
    }

    /// Registers a request and arms its timeout.
    ///
    /// Fails with `ConnectionClosed` once [`fail_all`](Self::fail_all) has run.
    pub fn register(
        &self,
        id: CorrelationId,
        request: &FetchRequest,
        timeout: Duration,
    ) -> Result<PendingHandle, ClientError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.inner.lock();
            if table.closed {
                return Err(ClientError::ConnectionClosed);
            }
            if table.entries.contains_key(&id) {
                error!(%id, "correlation id already in flight");
                return Err(ClientError::DuplicateId(id));
            }
            table.entries.insert(id, Entry::new(request, tx));
        }

        let timer = spawn_timer(Arc::downgrade(&self.inner), self.usable, id, timeout);
        let mut table = self.inner.lock();
        match table.entries.get_mut(&id) {
            Some(entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }

        trace!(%id, method = %request.method, url = %request.url, "request registered");
        Ok(PendingHandle { id, rx })
    }

    /// Attaches response metadata to its entry.
    pub fn on_response_frame(&self, frame: ResponseFrame) -> Result<(), ClientError> {
        let id = frame.id;
        let mut table = self.inner.lock();
        let entry = table
            .entries
            .get_mut(&id)
            .ok_or(ClientError::UnknownCorrelation(id))?;

        if entry.response.is_some() {
            warn!(%id, "duplicate response frame ignored");
            return Ok(());
        }

        let step = entry.attach(frame, self.usable);
        self.apply(table, id, step)
    }

    /// Stores one body chunk.
    pub fn on_chunk_frame(&self, chunk: ChunkFrame) -> Result<(), ClientError> {
        let id = chunk.id;
        let mut table = self.inner.lock();
        let entry = table
            .entries
            .get_mut(&id)
            .ok_or(ClientError::UnknownCorrelation(id))?;

        // Bounds what an entry can hold before its response frame arrives.
        let step = if chunk.payload.len() > self.usable {
            Step::Oversized {
                index: chunk.index,
                len: chunk.payload.len(),
            }
        } else if entry.response.is_some() {
            entry.fill(chunk.index, chunk.payload)
        } else {
            entry.early.entry(chunk.index).or_insert(chunk.payload);
            Step::Wait
        };
        self.apply(table, id, step)
    }

    /// Evicts an entry whose timer fired. Returns whether it was still present.
    pub fn on_timeout(&self, id: CorrelationId) -> bool {
        let Some(mut entry) = self.inner.lock().entries.remove(&id) else {
            return false;
        };
        entry.timer = None;
        warn!(%id, method = %entry.method, url = %entry.url, "request timed out");
        entry.finish(Err(ClientError::Timeout));
        true
    }

    /// Fails an entry with the server's error.
    pub fn on_error(&self, id: CorrelationId, frame: &ErrorFrame) -> Result<(), ClientError> {
        let entry = self
            .inner
            .lock()
            .entries
            .remove(&id)
            .ok_or(ClientError::UnknownCorrelation(id))?;

        debug!(%id, code = %frame.code, key = %frame.key, "request failed remotely");
        entry.finish(Err(ClientError::Remote {
            code: frame.code.clone(),
            key: frame.key.clone(),
            message: frame.message.clone(),
        }));
        Ok(())
    }

    /// Removes an entry and completes it with `err`.
    pub fn fail(&self, id: CorrelationId, err: ClientError) -> bool {
        match self.inner.lock().entries.remove(&id) {
            Some(entry) => {
                entry.finish(Err(err));
                true
            }
            None => false,
        }
    }

    /// Fails every entry and closes the table, returning how many entries
    /// there were. Later registrations fail with `ConnectionClosed`.
    pub fn fail_all(&self, make_err: impl Fn() -> ClientError) -> usize {
        let entries: Vec<Entry> = {
            let mut table = self.inner.lock();
            table.closed = true;
            table.entries.drain().map(|(_, e)| e).collect()
        };
        let count = entries.len();
        for entry in entries {
            entry.finish(Err(make_err()));
        }
        count
    }

    /// Removes an entry without completing it.
    pub fn discard(&self, id: CorrelationId) -> bool {
        match self.inner.lock().entries.remove(&id) {
            Some(mut entry) => {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    fn apply(
        &self,
        mut table: parking_lot::MutexGuard<'_, Table>,
        id: CorrelationId,
        step: Step,
    ) -> Result<(), ClientError> {
        if matches!(step, Step::Wait) {
            return Ok(());
        }
        let Some(entry) = table.entries.remove(&id) else {
            return Ok(());
        };
        drop(table);

        match step {
            Step::Wait => Ok(()),
            Step::Complete => {
                entry.complete(id);
                Ok(())
            }
            Step::OutOfRange { index, expected } => {
                error!(%id, index, expected, "chunk index out of range");
                entry.finish(Err(ClientError::IndexOutOfRange {
                    id,
                    index,
                    expected,
                }));
                Err(ClientError::IndexOutOfRange {
                    id,
                    index,
                    expected,
                })
            }
            Step::TooLarge { declared } => {
                let reason = format!(
                    "response for {} declares {} bytes, more than {} chunks can carry",
                    id, declared, MAX_CHUNKS
                );
                entry.finish(Err(ClientError::MalformedFrame(reason.clone())));
                Err(ClientError::MalformedFrame(reason))
            }
            Step::Oversized { index, len } => {
                warn!(%id, index, len, max = self.usable, "chunk payload exceeds packet size");
                let reason = format!(
                    "chunk {} for {} carries {} bytes, more than {}",
                    index, id, len, self.usable
                );
                entry.finish(Err(ClientError::MalformedFrame(reason.clone())));
                Err(ClientError::MalformedFrame(reason))
            }
        }
    }
}

fn spawn_timer(
    inner: Weak<Mutex<Table>>,
    usable: usize,
    id: CorrelationId,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(inner) = inner.upgrade() {
            PendingTable { inner, usable }.on_timeout(id);
        }
    })
}
