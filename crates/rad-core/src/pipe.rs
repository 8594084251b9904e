use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, Notify};

use rad_common::GatewayError;
use rad_protocol::chunk::Chunk;

pub const DEFAULT_CAPACITY: usize = 100;

/// Overflow signals, surfaced out of band from the chunk flow.
pub type PipeErrors = mpsc::UnboundedReceiver<GatewayError>;

struct PipeState {
    /// Direct-delivery slot: the chunk the consumer takes next. Filled when
    /// a send finds the pipe empty, i.e. the consumer is (or will be)
    /// immediately ready for it.
    ready: Option<Chunk>,
    buffer: VecDeque<Chunk>,
    closed: bool,
}

struct PipeInner {
    capacity: usize,
    state: Mutex<PipeState>,
    readable: Notify,
    errors: mpsc::UnboundedSender<GatewayError>,
    done: watch::Sender<bool>,
    terminal: AtomicBool,
    overflows: AtomicU64,
}

/// Bounded single-producer/single-consumer relay between the upstream
/// reader and the client writer.
///
/// Send policy: deliver directly when the consumer side is empty; otherwise
/// enqueue. A full buffer drops its oldest chunk to make room and reports
/// the drop on the error channel — the stream keeps going, losing one delta
/// degrades quality but preserves liveness.
#[derive(Clone)]
pub struct StreamPipe {
    inner: Arc<PipeInner>,
}

impl StreamPipe {
    pub fn new(capacity: usize) -> (Self, PipeErrors) {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (done_tx, _) = watch::channel(false);
        let pipe = Self {
            inner: Arc::new(PipeInner {
                capacity: capacity.max(1),
                state: Mutex::new(PipeState {
                    ready: None,
                    buffer: VecDeque::new(),
                    closed: false,
                }),
                readable: Notify::new(),
                errors: errors_tx,
                done: done_tx,
                terminal: AtomicBool::new(false),
                overflows: AtomicU64::new(0),
            }),
        };
        (pipe, errors_rx)
    }

    /// Enqueue one chunk. Fails fast once the pipe is closed.
    pub fn send(&self, chunk: Chunk) -> Result<(), GatewayError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(GatewayError::StreamClosed);
            }
            if state.ready.is_none() && state.buffer.is_empty() {
                state.ready = Some(chunk);
            } else {
                state.buffer.push_back(chunk);
                if state.buffer.len() > self.inner.capacity {
                    state.buffer.pop_front();
                    self.inner.overflows.fetch_add(1, Ordering::Relaxed);
                    let _ = self
                        .inner
                        .errors
                        .send(GatewayError::BufferOverflow { dropped: 1 });
                }
            }
        }
        self.inner.readable.notify_one();
        Ok(())
    }

    /// Next chunk in source order; `None` once closed and drained.
    pub async fn recv(&self) -> Option<Chunk> {
        loop {
            let notified = self.inner.readable.notified();
            {
                let mut state = self.lock();
                if let Some(chunk) = state.ready.take() {
                    return Some(chunk);
                }
                if let Some(chunk) = state.buffer.pop_front() {
                    return Some(chunk);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks that a terminal chunk (or terminal marker) passed through.
    pub fn mark_terminal(&self) {
        self.inner.terminal.store(true, Ordering::Release);
    }

    pub fn terminal(&self) -> bool {
        self.inner.terminal.load(Ordering::Acquire)
    }

    pub fn overflows(&self) -> u64 {
        self.inner.overflows.load(Ordering::Relaxed)
    }

    /// Idempotent. Buffered chunks stay readable; subsequent sends fail.
    /// Fires the done signal admission control watches.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.inner.readable.notify_waiters();
        let _ = self.inner.done.send(true);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Fires (transitions to `true`) when the pipe closes.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.inner.done.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PipeState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn chunk(tag: &str) -> Chunk {
        Chunk::new(tag, "gpt-4", 0).with_content(tag)
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let (pipe, _errors) = StreamPipe::new(10);
        pipe.send(chunk("a")).unwrap();
        pipe.send(chunk("b")).unwrap();
        assert_eq!(pipe.recv().await.unwrap().id, "a");
        assert_eq!(pipe.recv().await.unwrap().id, "b");
    }

    #[tokio::test]
    async fn overflow_drops_oldest_buffered_and_reports_once() {
        let (pipe, mut errors) = StreamPipe::new(2);
        // A takes the direct slot; B and C fill the buffer; D evicts B.
        for tag in ["a", "b", "c", "d"] {
            pipe.send(chunk(tag)).unwrap();
        }
        pipe.close();

        assert_eq!(pipe.recv().await.unwrap().id, "a");
        assert_eq!(pipe.recv().await.unwrap().id, "c");
        assert_eq!(pipe.recv().await.unwrap().id, "d");
        assert!(pipe.recv().await.is_none());

        assert_eq!(pipe.overflows(), 1);
        assert!(matches!(
            errors.recv().await,
            Some(GatewayError::BufferOverflow { dropped: 1 })
        ));
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_flushes_buffer() {
        let (pipe, _errors) = StreamPipe::new(10);
        pipe.send(chunk("a")).unwrap();
        pipe.close();
        pipe.close();
        assert_eq!(pipe.recv().await.unwrap().id, "a");
        assert!(pipe.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_fails_fast() {
        let (pipe, _errors) = StreamPipe::new(10);
        pipe.close();
        assert!(matches!(
            pipe.send(chunk("a")),
            Err(GatewayError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn recv_wakes_on_send() {
        let (pipe, _errors) = StreamPipe::new(10);
        let reader = pipe.clone();
        let handle = tokio::spawn(async move { reader.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        pipe.send(chunk("x")).unwrap();
        let received = timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.unwrap().id, "x");
    }

    #[tokio::test]
    async fn done_signal_fires_on_close() {
        let (pipe, _errors) = StreamPipe::new(10);
        let mut done = pipe.done();
        assert!(!*done.borrow());
        pipe.close();
        timeout(Duration::from_secs(1), done.wait_for(|fired| *fired))
            .await
            .unwrap()
            .unwrap();
    }
}
