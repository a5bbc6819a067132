// src/worker.rs

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::engine::Shared;
use crate::models::{ChunkResult, RequestDescriptor};
use crate::transport::{TransferError, Transport};

/// Lifecycle of a single worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Requesting,
    Streaming,
    Backoff,
    Retiring,
    Stopped,
}

/// Pool-side handle of a worker: identity, retirement flag and the token of
/// whatever it is currently waiting on.
#[derive(Debug)]
pub struct WorkerSlot {
    id: u64,
    retiring: AtomicBool,
    phase: Mutex<WorkerPhase>,
    token: Mutex<Option<CancellationToken>>,
}

impl WorkerSlot {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            retiring: AtomicBool::new(false),
            phase: Mutex::new(WorkerPhase::Idle),
            token: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> WorkerPhase {
        *self.phase.lock()
    }

    /// `Stopped` is terminal and `Retiring` can only be left for `Stopped`.
    pub fn set_phase(&self, next: WorkerPhase) {
        let mut phase = self.phase.lock();
        match (*phase, next) {
            (WorkerPhase::Stopped, _) => {}
            (WorkerPhase::Retiring, next) if next != WorkerPhase::Stopped => {}
            _ => *phase = next,
        }
    }

    /// Mark the worker as retiring and cancel its in-flight operation.
    pub fn retire(&self) {
        self.retiring.store(true, Ordering::SeqCst);
        self.set_phase(WorkerPhase::Retiring);
        if let Some(token) = self.token.lock().as_ref() {
            token.cancel();
        }
    }

    /// Install a fresh token for the next iteration. It is born cancelled if
    /// the worker was retired in the meantime.
    pub fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.token.lock() = Some(token.clone());
        if self.is_retiring() {
            token.cancel();
        }
        token
    }

    pub fn disarm(&self) {
        self.token.lock().take();
    }
}

/// How a transfer ended, when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Completed(ChunkResult),
    /// Cancelled by retirement or stop; carries what was read before that.
    Cancelled { partial: Option<ChunkResult> },
}

/// Per-transfer time limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    /// Until the response head arrives.
    pub response: Duration,
    /// Between two body reads.
    pub read_idle: Duration,
}

impl Deadlines {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            response: config.request_timeout(),
            read_idle: config.read_idle_timeout(),
        }
    }
}

impl Default for Deadlines {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Perform one request and drain its body, counting and discarding bytes.
///
/// A stalled response head or a body that goes quiet for longer than the
/// matching deadline fails with [`TransferError::Timeout`]; bytes read before
/// the stall are dropped with the failed chunk.
pub async fn transfer(
    transport: &dyn Transport,
    request: &RequestDescriptor,
    token: &CancellationToken,
    slot: &WorkerSlot,
    deadlines: Deadlines,
) -> Result<TransferOutcome, TransferError> {
    let started = Instant::now();
    slot.set_phase(WorkerPhase::Requesting);

    let response = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(TransferOutcome::Cancelled { partial: None }),
        response = timeout(deadlines.response, transport.get(request)) => {
            response.map_err(|_| TransferError::Timeout)??
        }
    };

    if !response.is_success() {
        return Err(TransferError::Status(response.status));
    }

    slot.set_phase(WorkerPhase::Streaming);
    let declared = response.content_length.filter(|len| *len > 0);
    let mut body = response.body;
    let mut logical_bytes = 0u64;
    let mut cancelled = false;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                cancelled = true;
                break;
            }
            next = timeout(deadlines.read_idle, body.next()) => match next {
                Ok(Some(Ok(bytes))) => logical_bytes += bytes.len() as u64,
                Ok(Some(Err(err))) => return Err(err),
                Ok(None) => break,
                Err(_) => return Err(TransferError::Timeout),
            },
        }
    }

    let chunk = |encoded_bytes| ChunkResult {
        encoded_bytes,
        logical_bytes,
        duration: started.elapsed(),
        source_id: request.source.id.clone(),
    };

    if cancelled {
        let partial = (logical_bytes > 0).then(|| chunk(logical_bytes));
        return Ok(TransferOutcome::Cancelled { partial });
    }
    Ok(TransferOutcome::Completed(chunk(declared.unwrap_or(logical_bytes))))
}

/// Worker loop: pick, fetch, count, repeat until retired or the engine stops.
pub(crate) async fn run(slot: Arc<WorkerSlot>, shared: Arc<Shared>) {
    let id = slot.id();
    let deadlines = Deadlines::from_config(shared.config());
    debug!(worker = id, "worker started");

    while shared.is_running() && !slot.is_retiring() {
        let token = slot.arm();
        if !shared.is_running() {
            break;
        }

        let result = match shared.build_request() {
            Some(request) => transfer(shared.transport(), &request, &token, &slot, deadlines).await,
            None => Err(TransferError::NoSource),
        };

        match result {
            Ok(TransferOutcome::Completed(chunk)) => {
                debug!(worker = id, source = %chunk.source_id, bytes = chunk.encoded_bytes, "chunk done");
                shared.record(chunk);
            }
            Ok(TransferOutcome::Cancelled { partial }) => {
                if let Some(chunk) = partial {
                    shared.record(chunk);
                }
                debug!(worker = id, "transfer cancelled");
                break;
            }
            Err(err) => {
                if !shared.is_running() {
                    break;
                }
                warn!(worker = id, error = %err, "transfer failed");
                shared.events().warn(format!("Worker {id} error: {err}"));

                slot.set_phase(WorkerPhase::Backoff);
                tokio::select! {
                    _ = tokio::time::sleep(shared.config().retry_backoff()) => {}
                    _ = token.cancelled() => {}
                }
            }
        }

        slot.disarm();
        slot.set_phase(WorkerPhase::Idle);
    }

    slot.disarm();
    slot.set_phase(WorkerPhase::Stopped);
    shared.pool().remove(id);
    debug!(worker = id, "worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceDescriptor;
    use crate::transport::{ProbeResponse, TransferResponse};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::stream;
    use std::time::Duration;

    /// Serves a fixed number of 1 KiB chunks, one every `pace`.
    struct Paced {
        status: u16,
        chunks: usize,
        declared: Option<u64>,
        pace: Duration,
    }

    #[async_trait]
    impl Transport for Paced {
        async fn get(&self, _request: &RequestDescriptor) -> Result<TransferResponse, TransferError> {
            let pace = self.pace;
            let body = stream::iter(0..self.chunks)
                .then(move |_| async move {
                    tokio::time::sleep(pace).await;
                    Ok(Bytes::from(vec![0u8; 1024]))
                })
                .boxed();
            Ok(TransferResponse {
                status: self.status,
                content_length: self.declared,
                body,
            })
        }

        async fn head(&self, _url: &str, _timeout: Duration) -> Result<ProbeResponse, TransferError> {
            Ok(ProbeResponse { status: 200, accept_ranges: None })
        }
    }

    fn request() -> RequestDescriptor {
        RequestDescriptor {
            source: SourceDescriptor::new("bbb", "bbb", "http://example.test/bbb"),
            url: "http://example.test/bbb?cb=1".into(),
            range: None,
            chunk_bytes: 4096,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completed_transfer_prefers_declared_length() {
        let transport = Paced { status: 206, chunks: 4, declared: Some(9000), pace: Duration::from_millis(10) };
        let slot = WorkerSlot::new(1);
        let token = CancellationToken::new();

        let outcome = transfer(&transport, &request(), &token, &slot, Deadlines::default()).await.unwrap();
        let TransferOutcome::Completed(chunk) = outcome else {
            panic!("expected a completed transfer");
        };
        assert_eq!(chunk.logical_bytes, 4096);
        assert_eq!(chunk.encoded_bytes, 9000);
        assert!(chunk.duration >= Duration::from_millis(40));
        assert_eq!(slot.phase(), WorkerPhase::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_length_falls_back_to_logical_bytes() {
        let transport = Paced { status: 200, chunks: 3, declared: Some(0), pace: Duration::from_millis(1) };
        let outcome = transfer(&transport, &request(), &CancellationToken::new(), &WorkerSlot::new(1), Deadlines::default())
            .await
            .unwrap();
        assert!(matches!(outcome, TransferOutcome::Completed(ref c) if c.encoded_bytes == 3072));
    }

    #[tokio::test(start_paused = true)]
    async fn error_status_is_a_failure() {
        let transport = Paced { status: 503, chunks: 1, declared: None, pace: Duration::ZERO };
        let err = transfer(&transport, &request(), &CancellationToken::new(), &WorkerSlot::new(1), Deadlines::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Status(503)));
    }

    #[tokio::test(start_paused = true)]
    async fn retiring_mid_stream_reports_partial_bytes() {
        let transport = Paced { status: 200, chunks: 100, declared: Some(102_400), pace: Duration::from_millis(10) };
        let slot = Arc::new(WorkerSlot::new(7));
        let token = slot.arm();

        let retiring = Arc::clone(&slot);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(35)).await;
            retiring.retire();
        });

        let outcome = transfer(&transport, &request(), &token, &slot, Deadlines::default()).await.unwrap();
        let TransferOutcome::Cancelled { partial: Some(chunk) } = outcome else {
            panic!("expected a partial transfer");
        };
        assert_eq!(chunk.logical_bytes, 3 * 1024);
        assert_eq!(chunk.encoded_bytes, chunk.logical_bytes);
        assert_eq!(slot.phase(), WorkerPhase::Retiring);
    }

    /// First body piece arrives, then the stream goes silent.
    struct Stalled {
        head_delay: Duration,
    }

    #[async_trait]
    impl Transport for Stalled {
        async fn get(&self, _request: &RequestDescriptor) -> Result<TransferResponse, TransferError> {
            tokio::time::sleep(self.head_delay).await;
            let body = stream::once(async { Ok(Bytes::from_static(&[0u8; 512])) })
                .chain(stream::pending())
                .boxed();
            Ok(TransferResponse { status: 206, content_length: Some(4096), body })
        }

        async fn head(&self, _url: &str, _timeout: Duration) -> Result<ProbeResponse, TransferError> {
            Ok(ProbeResponse { status: 200, accept_ranges: None })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_body_times_out() {
        let deadlines = Deadlines { response: Duration::from_secs(5), read_idle: Duration::from_secs(2) };
        let transport = Stalled { head_delay: Duration::from_millis(10) };
        let started = Instant::now();

        let err = transfer(&transport, &request(), &CancellationToken::new(), &WorkerSlot::new(1), deadlines)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Timeout));
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_response_head_times_out() {
        let deadlines = Deadlines { response: Duration::from_secs(1), read_idle: Duration::from_secs(30) };
        let transport = Stalled { head_delay: Duration::from_secs(60) };
        let slot = WorkerSlot::new(1);

        let err = transfer(&transport, &request(), &CancellationToken::new(), &slot, deadlines)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Timeout));
        assert_eq!(slot.phase(), WorkerPhase::Requesting);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_still_wins_over_a_stalled_body() {
        let transport = Stalled { head_delay: Duration::ZERO };
        let slot = Arc::new(WorkerSlot::new(4));
        let token = slot.arm();

        let retiring = Arc::clone(&slot);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            retiring.retire();
        });

        let outcome = transfer(&transport, &request(), &token, &slot, Deadlines::default()).await.unwrap();
        let TransferOutcome::Cancelled { partial: Some(chunk) } = outcome else {
            panic!("expected a partial transfer");
        };
        assert_eq!(chunk.logical_bytes, 512);
    }

    #[test]
    fn arming_a_retired_slot_yields_a_cancelled_token() {
        let slot = WorkerSlot::new(3);
        let first = slot.arm();
        slot.retire();
        assert!(first.is_cancelled());
        assert!(slot.arm().is_cancelled());
    }

    #[test]
    fn stopped_is_terminal() {
        let slot = WorkerSlot::new(1);
        slot.set_phase(WorkerPhase::Streaming);
        slot.retire();
        slot.set_phase(WorkerPhase::Idle);
        assert_eq!(slot.phase(), WorkerPhase::Retiring);
        slot.set_phase(WorkerPhase::Stopped);
        slot.set_phase(WorkerPhase::Requesting);
        assert_eq!(slot.phase(), WorkerPhase::Stopped);
    }
}
