use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rad_common::GatewayError;
use rad_protocol::chunk::ChunkUsage;
use rad_protocol::sse::{SseEvent, SseParser};
use rad_provider_core::ByteStream;
use rad_transform::{emit, StreamTransformer, TransformError, TransformOutcome};

use crate::pipe::{PipeErrors, StreamPipe};
use crate::writer::ClientWriter;

#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    /// Chunks written to the client.
    pub chunks: u64,
    /// Non-empty content deltas seen; the token-count floor for streams
    /// whose upstream omits terminal usage.
    pub content_deltas: u64,
    /// Last upstream-reported usage, usually from the terminal chunk.
    pub usage: Option<ChunkUsage>,
    pub overflows: u64,
    /// Producer closed the input cleanly and the consumer drained it.
    pub completed: bool,
}

struct Shared {
    first_error: Mutex<Option<GatewayError>>,
    stats: Mutex<StreamStats>,
}

impl Shared {
    fn record_error(&self, error: GatewayError) {
        let mut first = self
            .first_error
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if first.is_none() {
            *first = Some(error);
        }
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, StreamStats> {
        self.stats.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Owns one streaming request end to end: the upstream reader, the pipe,
/// and the client writer. Two cooperating tasks run under one cancellation
/// token; dropping the orchestrator cancels both.
pub struct StreamOrchestrator {
    cancel: CancellationToken,
    producer: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl StreamOrchestrator {
    pub fn spawn(
        upstream: ByteStream,
        transformer: StreamTransformer,
        pipe: StreamPipe,
        pipe_errors: PipeErrors,
        writer: ClientWriter,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared {
            first_error: Mutex::new(None),
            stats: Mutex::new(StreamStats::default()),
        });

        let producer = tokio::spawn(produce(
            upstream,
            transformer,
            pipe.clone(),
            shared.clone(),
            cancel.clone(),
        ));
        let consumer = tokio::spawn(consume(
            pipe,
            pipe_errors,
            writer,
            shared.clone(),
            cancel.clone(),
        ));

        Self {
            cancel,
            producer: Some(producer),
            consumer: Some(consumer),
            shared,
        }
    }

    /// Blocks until both tasks return. The error is the first one either
    /// task captured, or `None` for a clean stream.
    pub async fn wait(&mut self) -> (StreamStats, Option<GatewayError>) {
        if let Some(handle) = self.producer.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.consumer.take() {
            let _ = handle.await;
        }
        let stats = self.shared.stats().clone();
        let error = self
            .shared
            .first_error
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone();
        (stats, error)
    }

    /// Idempotent; cancels the internal context, which cascades to the
    /// pipe and both tasks.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for StreamOrchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Parse-transform worker: upstream bytes → SSE events → unified chunks →
/// pipe input. Closes the input on error, cancellation, or upstream EOF.
async fn produce(
    mut upstream: ByteStream,
    mut transformer: StreamTransformer,
    pipe: StreamPipe,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut parser = SseParser::new();
    'outer: loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break 'outer,
            item = upstream.next() => item,
        };
        match item {
            Some(Ok(bytes)) => {
                for event in parser.push_bytes(&bytes) {
                    if forward(&mut transformer, &event, &pipe, &shared).is_break() {
                        break 'outer;
                    }
                }
            }
            Some(Err(err)) => {
                shared.record_error(GatewayError::StreamParse(err.to_string()));
                break 'outer;
            }
            None => {
                for event in parser.finish() {
                    if forward(&mut transformer, &event, &pipe, &shared).is_break() {
                        break;
                    }
                }
                break 'outer;
            }
        }
    }
    pipe.close();
}

fn forward(
    transformer: &mut StreamTransformer,
    event: &SseEvent,
    pipe: &StreamPipe,
    shared: &Shared,
) -> ControlFlow<()> {
    match transformer.transform(event) {
        TransformOutcome::Chunk(chunk) => {
            {
                let mut stats = shared.stats();
                if chunk.content().is_some() {
                    stats.content_deltas += 1;
                }
                if let Some(usage) = &chunk.usage {
                    stats.usage = Some(usage.clone());
                }
            }
            if chunk.is_finished() {
                pipe.mark_terminal();
            }
            if pipe.send(chunk).is_err() {
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        }
        TransformOutcome::Skip => ControlFlow::Continue(()),
        TransformOutcome::Done => {
            pipe.mark_terminal();
            ControlFlow::Continue(())
        }
        TransformOutcome::Error(error) => {
            shared.record_error(match &error {
                TransformError::Malformed { .. } => {
                    GatewayError::StreamTransform(error.to_string())
                }
                TransformError::Upstream(message) => {
                    GatewayError::StreamTransform(message.clone())
                }
            });
            ControlFlow::Break(())
        }
    }
}

/// Write-to-client worker: pipe output → SSE frames. Emits the `[DONE]`
/// marker only after a clean drain that saw a terminal chunk — a stream
/// that dies early simply stops, and clients detect the missing marker.
async fn consume(
    pipe: StreamPipe,
    mut pipe_errors: PipeErrors,
    writer: ClientWriter,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut errors_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                shared.record_error(GatewayError::ClientDisconnect);
                break;
            }
            chunk = pipe.recv() => match chunk {
                Some(chunk) => {
                    let frame = match emit::chunk_frame(&chunk) {
                        Ok(frame) => frame,
                        Err(err) => {
                            shared.record_error(GatewayError::StreamTransform(err.to_string()));
                            break;
                        }
                    };
                    if let Err(error) = writer.write_event(&frame).await {
                        shared.record_error(error);
                        break;
                    }
                    shared.stats().chunks += 1;
                }
                None => {
                    let clean = shared
                        .first_error
                        .lock()
                        .unwrap_or_else(|poison| poison.into_inner())
                        .is_none();
                    if clean && pipe.terminal() {
                        let _ = writer.write_event(&emit::done_frame()).await;
                    }
                    let mut stats = shared.stats();
                    stats.completed = clean;
                    stats.overflows = pipe.overflows();
                    break;
                }
            },
            overflow = pipe_errors.recv(), if errors_open => match overflow {
                Some(error) => {
                    warn!(event = "stream_overflow", error = %error);
                }
                None => errors_open = false,
            },
        }
    }
    writer.close();
}
