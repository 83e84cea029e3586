//! Batch transcription accumulator
//!
//! Buffers raw linear PCM per call and flushes to the transcription sink
//! when either threshold trips: buffered size reaching `max_bytes`, or age
//! reaching `max_interval`. `feed` sits on the relay hot path and must
//! never block on I/O: appends happen under a short dashmap entry lock,
//! and the buffer is swapped out before any sink call. Flush failures are
//! re-queued at the front of the buffer and retried on the next tick;
//! they never reach the relay.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::sink::TranscriptionSink;

/// Flush thresholds for the per-call buffers
#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    /// Flush when a buffer reaches this many PCM bytes
    pub max_bytes: usize,
    /// Flush any non-empty buffer older than this
    pub max_interval: Duration,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        // 20 seconds of 8 kHz s16le audio per batch by default.
        AccumulatorConfig {
            max_bytes: 320_000,
            max_interval: Duration::from_secs(10),
        }
    }
}

struct CallBuffer {
    pcm: Vec<u8>,
    last_flush: Instant,
}

struct Inner {
    buffers: DashMap<String, CallBuffer>,
    config: AccumulatorConfig,
    sink: Arc<dyn TranscriptionSink>,
    flush_count: AtomicU64,
    failure_count: AtomicU64,
}

/// Per-call PCM accumulator with a background flush scheduler
///
/// Cheap to clone; all clones share the same buffers.
#[derive(Clone)]
pub struct TranscriptionAccumulator {
    inner: Arc<Inner>,
}

impl TranscriptionAccumulator {
    pub fn new(config: AccumulatorConfig, sink: Arc<dyn TranscriptionSink>) -> Self {
        TranscriptionAccumulator {
            inner: Arc::new(Inner {
                buffers: DashMap::new(),
                config,
                sink,
                flush_count: AtomicU64::new(0),
                failure_count: AtomicU64::new(0),
            }),
        }
    }

    /// Create the buffer for a call. Buffers share the session's lifetime;
    /// `feed` also creates one lazily so a racing media frame is never lost.
    pub fn open(&self, call_id: &str) {
        self.inner
            .buffers
            .entry(call_id.to_string())
            .or_insert_with(|| CallBuffer {
                pcm: Vec::new(),
                last_flush: Instant::now(),
            });
    }

    /// Append linear PCM to a call's buffer, flushing if the size
    /// threshold trips. Non-blocking with respect to the caller: sink I/O
    /// runs on a spawned task after the entry lock is released.
    pub fn feed(&self, call_id: &str, pcm: &[u8]) {
        if pcm.is_empty() {
            return;
        }

        let mut batches: Vec<Vec<u8>> = Vec::new();
        {
            let mut entry =
                self.inner
                    .buffers
                    .entry(call_id.to_string())
                    .or_insert_with(|| CallBuffer {
                        pcm: Vec::new(),
                        last_flush: Instant::now(),
                    });

            // Flush ahead of an append that would push past the cap, so a
            // flushed batch never exceeds max_bytes.
            if !entry.pcm.is_empty() && entry.pcm.len() + pcm.len() > self.inner.config.max_bytes {
                batches.push(std::mem::take(&mut entry.pcm));
                entry.last_flush = Instant::now();
            }

            entry.pcm.extend_from_slice(pcm);
            if entry.pcm.len() >= self.inner.config.max_bytes {
                batches.push(std::mem::take(&mut entry.pcm));
                entry.last_flush = Instant::now();
            }
        }

        for bytes in batches {
            let inner = Arc::clone(&self.inner);
            let id = call_id.to_string();
            tokio::spawn(async move {
                inner.flush_batch(&id, bytes, true).await;
            });
        }
    }

    /// Flush whatever remains for a call and drop its buffer. Called on
    /// session teardown.
    pub async fn force_flush(&self, call_id: &str) {
        if let Some((_, buffer)) = self.inner.buffers.remove(call_id) {
            if !buffer.pcm.is_empty() {
                self.inner.flush_batch(call_id, buffer.pcm, false).await;
            }
        }
    }

    /// Spawn the background task that flushes buffers older than
    /// `max_interval`.
    pub fn spawn_flush_task(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.check_period());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                inner.flush_due().await;
            }
        })
    }

    /// Total successful flushes.
    pub fn flush_count(&self) -> u64 {
        self.inner.flush_count.load(Ordering::Relaxed)
    }

    /// Total failed flush attempts.
    pub fn failure_count(&self) -> u64 {
        self.inner.failure_count.load(Ordering::Relaxed)
    }
}

impl Inner {
    fn check_period(&self) -> Duration {
        (self.config.max_interval / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
    }

    async fn flush_due(&self) {
        let now = Instant::now();
        let mut due = Vec::new();
        for mut entry in self.buffers.iter_mut() {
            if !entry.pcm.is_empty()
                && now.duration_since(entry.last_flush) >= self.config.max_interval
            {
                let bytes = std::mem::take(&mut entry.pcm);
                entry.last_flush = now;
                due.push((entry.key().clone(), bytes));
            }
        }
        // Sink calls happen after every shard lock is released.
        for (call_id, bytes) in due {
            self.flush_batch(&call_id, bytes, true).await;
        }
    }

    async fn flush_batch(&self, call_id: &str, bytes: Vec<u8>, requeue_on_failure: bool) {
        let size = bytes.len();
        let payload = Bytes::from(bytes);

        match self.sink.transcribe(call_id, payload.clone()).await {
            Ok(segments) => {
                self.flush_count.fetch_add(1, Ordering::Relaxed);
                debug!(
                    call_id = %call_id,
                    bytes = size,
                    segments = segments.len(),
                    "Flushed audio batch to transcription"
                );
            }
            Err(err) => {
                self.failure_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    call_id = %call_id,
                    bytes = size,
                    error = %err,
                    "Transcription flush failed"
                );
                if requeue_on_failure {
                    if let Some(mut entry) = self.buffers.get_mut(call_id) {
                        let mut merged = payload.to_vec();
                        merged.extend_from_slice(&entry.pcm);
                        entry.pcm = merged;
                        // Backdate the buffer so the next tick retries.
                        if let Some(earlier) =
                            entry.last_flush.checked_sub(self.config.max_interval)
                        {
                            entry.last_flush = earlier;
                        }
                    } else {
                        warn!(
                            call_id = %call_id,
                            bytes = size,
                            "Buffer gone after failed flush, dropping batch"
                        );
                    }
                }
            }
        }
    }
}
