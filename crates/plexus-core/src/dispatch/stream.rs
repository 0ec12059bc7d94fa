//! The streaming pipeline: upstream SSE → dialect decode → unified
//! chunks → client-dialect encode → client bytes, with accounting on
//! the side.
//!
//! Backpressure is the bounded client channel (64 frames). Client
//! disconnect surfaces as a failed send; dropping the upstream receiver
//! aborts the upstream read task. A usage row is written on every exit,
//! disconnect included.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{info, warn};

use plexus_protocol::sse::SseSplitter;
use plexus_storage::UsageRecord;
use plexus_transform::dialect::StreamIds;
use plexus_transform::reconstruct::ChunkAccumulator;
use plexus_transform::{Dialect, UnifiedStreamChunk, reconstruct_from_stream};

use crate::config::Pricing;
use crate::pricing::{PricingOracle, compute_cost};
use crate::usage::{UsageRecorder, apply_usage};

/// Client-facing frame buffer: chunks beyond this apply backpressure to
/// the transform stage.
const CLIENT_QUEUE_FRAMES: usize = 64;

pub struct StreamPipeline {
    pub upstream: tokio::sync::mpsc::Receiver<Result<Bytes, String>>,
    pub provider_dialect: Dialect,
    pub client_dialect: Dialect,
    pub ids: StreamIds,
    pub pass_through: bool,
    pub recorder: UsageRecorder,
    pub record: UsageRecord,
    pub pricing: Option<(Pricing, f64)>,
    pub oracle: Arc<dyn PricingOracle>,
    pub start: Instant,
}

enum Exit {
    Clean,
    ClientGone,
    UpstreamError(String),
}

pub fn spawn_pipeline(
    pipeline: StreamPipeline,
) -> tokio::sync::mpsc::Receiver<Result<Bytes, std::io::Error>> {
    let (tx, rx) = tokio::sync::mpsc::channel(CLIENT_QUEUE_FRAMES);
    tokio::spawn(run(pipeline, tx));
    rx
}

async fn run(
    mut pipeline: StreamPipeline,
    tx: tokio::sync::mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let mut splitter = SseSplitter::new();
    let mut decoder = pipeline.provider_dialect.decoder();
    let mut encoder = pipeline.client_dialect.encoder(pipeline.ids.clone());
    let mut accumulator = ChunkAccumulator::new();
    let mut raw_capture: Vec<u8> = Vec::new();
    let mut ttft_ms: Option<i64> = None;

    let mut exit = Exit::Clean;
    'pump: while let Some(item) = pipeline.upstream.recv().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(message) => {
                exit = Exit::UpstreamError(message);
                break;
            }
        };
        raw_capture.extend_from_slice(&bytes);

        let mut out_frames = Vec::new();
        for frame in splitter.push_bytes(&bytes) {
            match decoder.push(&frame) {
                Ok(chunks) => {
                    for chunk in &chunks {
                        observe_chunk(chunk, &mut ttft_ms, pipeline.start);
                        accumulator.push(chunk);
                        if !pipeline.pass_through {
                            out_frames.extend(encoder.encode(chunk));
                        }
                    }
                }
                Err(err) => {
                    warn!(event = "stream_frame_skipped", error = %err);
                }
            }
        }

        if pipeline.pass_through {
            if tx.send(Ok(bytes)).await.is_err() {
                exit = Exit::ClientGone;
                break 'pump;
            }
        } else {
            for frame in out_frames {
                if tx.send(Ok(frame.encode())).await.is_err() {
                    exit = Exit::ClientGone;
                    break 'pump;
                }
            }
        }
    }

    // Abort the upstream read as soon as the client is gone.
    if matches!(exit, Exit::ClientGone) {
        pipeline.upstream.close();
    }

    if !matches!(exit, Exit::ClientGone) {
        let trailing = splitter.finish();
        if !trailing.is_empty() {
            warn!(event = "stream_unterminated_frames", count = trailing.len());
        }
        for frame in trailing {
            if let Ok(chunks) = decoder.push(&frame) {
                for chunk in &chunks {
                    observe_chunk(chunk, &mut ttft_ms, pipeline.start);
                    accumulator.push(chunk);
                    if !pipeline.pass_through {
                        for frame in encoder.encode(chunk) {
                            if tx.send(Ok(frame.encode())).await.is_err() {
                                exit = Exit::ClientGone;
                                break;
                            }
                        }
                    }
                }
            } else {
                warn!(event = "stream_trailing_frame_dropped");
            }
        }

        let terminal = match &exit {
            Exit::UpstreamError(message) => {
                warn!(event = "stream_upstream_error", error = %message);
                let mut frames = Vec::new();
                if pipeline.pass_through {
                    // Re-align framing before speaking into a verbatim
                    // stream that may have died mid-frame.
                    frames.push(Bytes::from_static(b"\n\n"));
                }
                frames.extend(encoder.encode_error("upstream stream failed").iter().map(|f| f.encode()));
                frames
            }
            _ if !pipeline.pass_through => {
                encoder.finish().iter().map(|f| f.encode()).collect()
            }
            _ => Vec::new(),
        };
        for frame in terminal {
            if tx.send(Ok(frame)).await.is_err() {
                exit = Exit::ClientGone;
                break;
            }
        }
    }

    finalize(pipeline, accumulator, raw_capture, ttft_ms, exit).await;
}

fn observe_chunk(chunk: &UnifiedStreamChunk, ttft_ms: &mut Option<i64>, start: Instant) {
    if ttft_ms.is_some() {
        return;
    }
    let is_first_token = match chunk {
        UnifiedStreamChunk::DeltaText { text } => !text.is_empty(),
        UnifiedStreamChunk::DeltaThinking { text, .. } => !text.is_empty(),
        _ => false,
    };
    if is_first_token {
        *ttft_ms = Some(start.elapsed().as_millis() as i64);
    }
}

async fn finalize(
    pipeline: StreamPipeline,
    accumulator: ChunkAccumulator,
    raw_capture: Vec<u8>,
    ttft_ms: Option<i64>,
    exit: Exit,
) {
    let mut record = pipeline.record;
    record.duration_ms = pipeline.start.elapsed().as_millis() as i64;
    record.ttft_ms = ttft_ms;
    record.is_streamed = true;
    record.response_status = match &exit {
        Exit::ClientGone => "client_disconnect".to_string(),
        _ => "200".to_string(),
    };
    if let Exit::UpstreamError(message) = &exit {
        record.error_code = Some("upstream_stream_error".to_string());
        record.error_message = Some(message.clone());
    }

    // The stream usually carries usage near the end; when it does not,
    // reconstruct from the raw capture as a best effort.
    let usage = accumulator.usage().unwrap_or_else(|| {
        reconstruct_from_stream(pipeline.provider_dialect, &raw_capture)
            .map(|response| response.usage)
            .unwrap_or_default()
    });
    apply_usage(&mut record, &usage);
    if let Some((pricing, discount)) = &pipeline.pricing {
        let outcome = compute_cost(pricing, *discount, &usage, pipeline.oracle.as_ref());
        record.cost_usd = Some(outcome.cost_usd);
        record.pricing_unknown = outcome.pricing_unknown;
    }

    info!(
        event = "downstream_responded",
        request_id = %record.request_id,
        status = %record.response_status,
        elapsed_ms = record.duration_ms,
        ttft_ms = record.ttft_ms,
        is_stream = true,
    );
    pipeline.recorder.record(record).await;
}
