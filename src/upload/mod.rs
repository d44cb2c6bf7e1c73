//! Chunked streaming upload.
//!
//! One `UploadPipeline::run` per capture session: `begin` goes out before
//! the first part, every chunk becomes one `part` call in emission order,
//! and the session completes only when the backend acknowledges the part
//! carrying the final marker.
//!
//! Parts are sent strictly one after another. A failing part is retried with
//! exponential backoff and then aborts the session; the final part is
//! bounded by a timeout so a backend that never acknowledges cannot starve
//! the session.

pub mod s3;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::UploadError;
use crate::recording::Chunk;

pub use s3::{S3Config, S3Uploader};

#[async_trait]
pub trait UploadBackend: Send + Sync {
    /// Open a new upload session.
    async fn begin(&self) -> anyhow::Result<()>;

    /// Send one part. The response is only meaningful for the final part,
    /// where a truthy answer completes the session.
    async fn part(&self, data: Bytes, is_final: bool) -> anyhow::Result<bool>;

    /// Where the finished upload can be fetched, if the backend knows.
    async fn location(&self) -> Option<String> {
        None
    }
}

/// Creates one backend per upload session.
pub trait UploadBackendFactory: Send + Sync {
    fn create(&self, mime: &str) -> anyhow::Result<Arc<dyn UploadBackend>>;
}

/// Used when no upload destination is configured; every session fails to
/// start with a clear message.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unconfigured;

impl UploadBackendFactory for Unconfigured {
    fn create(&self, _mime: &str) -> anyhow::Result<Arc<dyn UploadBackend>> {
        anyhow::bail!("no upload destination configured")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UploadPolicy {
    /// Retries after the first failed attempt of a part.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub backoff_base: Duration,
    /// Upper bound for the final part, retries included.
    pub finalize_timeout: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            finalize_timeout: Duration::from_secs(60),
        }
    }
}

impl UploadPolicy {
    fn backoff(&self, retry: u32) -> Duration {
        self.backoff_base.saturating_mul(1u32 << retry.min(16))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    pub seq: u64,
    pub bytes: usize,
    pub is_final: bool,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: Uuid,
    pub begun: bool,
    pub parts: Vec<PartRecord>,
    pub finalized: bool,
}

impl UploadSession {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            begun: false,
            parts: Vec::new(),
            finalized: false,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.bytes as u64).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub session: UploadSession,
    pub location: Option<String>,
}

/// Progress notifications for the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Started { session: Uuid },
    Progress { parts: usize, bytes: u64 },
    Done { location: Option<String> },
    Failed { message: String },
}

pub struct UploadPipeline {
    backend: Arc<dyn UploadBackend>,
    policy: UploadPolicy,
    events: Option<mpsc::UnboundedSender<UploadEvent>>,
}

impl UploadPipeline {
    pub fn new(backend: Arc<dyn UploadBackend>, policy: UploadPolicy) -> Self {
        Self {
            backend,
            policy,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<UploadEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: UploadEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Drive one session to completion. Dropping `chunks` early (returning an
    /// error) tells the recorder side the upload is gone.
    pub async fn run(&self, mut chunks: mpsc::Receiver<Chunk>) -> Result<UploadSummary, UploadError> {
        let result = self.drive(&mut chunks).await;
        match &result {
            Ok(summary) => {
                info!(
                    session = %summary.session.id,
                    parts = summary.session.parts.len(),
                    bytes = summary.session.total_bytes(),
                    "Upload session complete"
                );
                self.emit(UploadEvent::Done {
                    location: summary.location.clone(),
                });
            }
            Err(e) => {
                error!("Upload session failed: {}", e);
                self.emit(UploadEvent::Failed {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn drive(&self, chunks: &mut mpsc::Receiver<Chunk>) -> Result<UploadSummary, UploadError> {
        let mut session = UploadSession::new();

        let Some(first) = chunks.recv().await else {
            return Err(UploadError::Incomplete);
        };

        self.backend
            .begin()
            .await
            .map_err(|e| UploadError::Begin(e.to_string()))?;
        session.begun = true;
        info!(session = %session.id, "Upload session begun");
        self.emit(UploadEvent::Started { session: session.id });

        let mut next = Some(first);
        while let Some(chunk) = next.take() {
            let seq = chunk.seq;
            let bytes = chunk.data.len();
            let is_final = chunk.is_final;

            if is_final {
                let timeout = self.policy.finalize_timeout;
                let (acked, attempts) = tokio::time::timeout(timeout, self.send_part(chunk))
                    .await
                    .map_err(|_| UploadError::FinalizeTimeout(timeout))??;
                session.parts.push(PartRecord {
                    seq,
                    bytes,
                    is_final,
                    attempts,
                });
                if !acked {
                    return Err(UploadError::FinalizeRejected);
                }
                session.finalized = true;
                self.emit_progress(&session);
                let location = self.backend.location().await;
                return Ok(UploadSummary { session, location });
            }

            let (_, attempts) = self.send_part(chunk).await?;
            session.parts.push(PartRecord {
                seq,
                bytes,
                is_final,
                attempts,
            });
            self.emit_progress(&session);
            next = chunks.recv().await;
        }

        warn!(session = %session.id, parts = session.parts.len(), "Chunk stream ended without a final chunk");
        Err(UploadError::Incomplete)
    }

    fn emit_progress(&self, session: &UploadSession) {
        self.emit(UploadEvent::Progress {
            parts: session.parts.len(),
            bytes: session.total_bytes(),
        });
    }

    /// One part with retries. Returns the backend's answer and the number of
    /// attempts it took.
    async fn send_part(&self, chunk: Chunk) -> Result<(bool, u32), UploadError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.backend.part(chunk.data.clone(), chunk.is_final).await {
                Ok(acked) => {
                    debug!(seq = chunk.seq, attempt, is_final = chunk.is_final, "Part uploaded");
                    return Ok((acked, attempt));
                }
                Err(e) if attempt <= self.policy.max_retries => {
                    let delay = self.policy.backoff(attempt - 1);
                    warn!(
                        seq = chunk.seq,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Part upload failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(UploadError::Part {
                        seq: chunk.seq,
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BackendCall, FakeBackend};

    fn chunk(seq: u64, is_final: bool) -> Chunk {
        Chunk {
            seq,
            data: Bytes::from(vec![seq as u8; 10]),
            is_final,
        }
    }

    async fn feed(chunks: Vec<Chunk>) -> mpsc::Receiver<Chunk> {
        let (tx, rx) = mpsc::channel(16);
        for c in chunks {
            tx.send(c).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn test_begin_precedes_parts_and_one_final() {
        let backend = Arc::new(FakeBackend::default());
        let pipeline = UploadPipeline::new(backend.clone(), UploadPolicy::default());
        let rx = feed(vec![chunk(0, false), chunk(1, false), chunk(2, true)]).await;

        let summary = pipeline.run(rx).await.unwrap();
        assert!(summary.session.begun);
        assert!(summary.session.finalized);
        assert_eq!(summary.session.parts.len(), 3);
        assert_eq!(summary.session.total_bytes(), 30);

        let calls = backend.calls();
        assert_eq!(calls[0], BackendCall::Begin);
        assert_eq!(calls.iter().filter(|c| **c == BackendCall::Begin).count(), 1);
        let finals: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, BackendCall::Part { is_final: true, .. }))
            .collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(calls.last().unwrap(), finals[0]);
    }

    #[tokio::test]
    async fn test_parts_in_emission_order() {
        let backend = Arc::new(FakeBackend::default());
        let pipeline = UploadPipeline::new(backend.clone(), UploadPolicy::default());
        let rx = feed((0..5).map(|i| chunk(i, i == 4)).collect()).await;
        pipeline.run(rx).await.unwrap();

        let seqs: Vec<u8> = backend
            .calls()
            .iter()
            .filter_map(|c| match c {
                BackendCall::Part { first_byte, .. } => Some(*first_byte),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_begin_failure_sends_no_part() {
        let backend = Arc::new(FakeBackend::default());
        backend.fail_begin();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let pipeline =
            UploadPipeline::new(backend.clone(), UploadPolicy::default()).with_events(events_tx);
        let rx = feed(vec![chunk(0, true)]).await;

        let err = pipeline.run(rx).await.unwrap_err();
        assert!(matches!(err, UploadError::Begin(_)));
        assert_eq!(backend.calls(), vec![BackendCall::Begin]);
        assert!(matches!(events.recv().await, Some(UploadEvent::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_part_retried_then_succeeds() {
        let backend = Arc::new(FakeBackend::default());
        backend.fail_parts(2);
        let pipeline = UploadPipeline::new(backend.clone(), UploadPolicy::default());
        let rx = feed(vec![chunk(0, false), chunk(1, true)]).await;

        let summary = pipeline.run(rx).await.unwrap();
        assert_eq!(summary.session.parts[0].attempts, 3);
        assert_eq!(summary.session.parts[1].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_part_failure_aborts_after_retries() {
        let backend = Arc::new(FakeBackend::default());
        backend.fail_parts(100);
        let policy = UploadPolicy {
            max_retries: 2,
            ..Default::default()
        };
        let pipeline = UploadPipeline::new(backend.clone(), policy);
        let rx = feed(vec![chunk(0, false), chunk(1, true)]).await;

        match pipeline.run(rx).await {
            Err(UploadError::Part { seq, attempts, .. }) => {
                assert_eq!(seq, 0);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!backend
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::Part { is_final: true, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_final_times_out() {
        let backend = Arc::new(FakeBackend::default());
        backend.stall_final();
        let policy = UploadPolicy {
            finalize_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let pipeline = UploadPipeline::new(backend.clone(), policy);
        let rx = feed(vec![chunk(0, false), chunk(1, true)]).await;

        let err = pipeline.run(rx).await.unwrap_err();
        assert!(matches!(err, UploadError::FinalizeTimeout(d) if d == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_falsy_final_is_rejected() {
        let backend = Arc::new(FakeBackend::default());
        backend.reject_final();
        let pipeline = UploadPipeline::new(backend.clone(), UploadPolicy::default());
        let rx = feed(vec![chunk(0, true)]).await;
        assert!(matches!(
            pipeline.run(rx).await,
            Err(UploadError::FinalizeRejected)
        ));
    }

    #[tokio::test]
    async fn test_stream_without_final_is_incomplete() {
        let backend = Arc::new(FakeBackend::default());
        let pipeline = UploadPipeline::new(backend.clone(), UploadPolicy::default());
        let rx = feed(vec![chunk(0, false)]).await;
        assert!(matches!(pipeline.run(rx).await, Err(UploadError::Incomplete)));

        let empty = feed(vec![]).await;
        assert!(matches!(pipeline.run(empty).await, Err(UploadError::Incomplete)));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = UploadPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
    }
}
