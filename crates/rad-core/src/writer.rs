use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use rad_common::GatewayError;
use rad_protocol::sse::SseEvent;

/// SSE writer over the response-body channel. Writes are serialized; the
/// receiver side going away means the client disconnected. Writes after
/// [`ClientWriter::close`] fail with `StreamClosed`.
pub struct ClientWriter {
    tx: mpsc::Sender<Bytes>,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl ClientWriter {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx,
                write_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub async fn write_event(&self, event: &SseEvent) -> Result<(), GatewayError> {
        self.write_raw(event.to_frame()).await
    }

    pub async fn write_raw(&self, frame: Bytes) -> Result<(), GatewayError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::StreamClosed);
        }
        let _guard = self.write_lock.lock().await;
        self.tx
            .send(frame)
            .await
            .map_err(|_| GatewayError::ClientDisconnect)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_after_close_fails() {
        let (writer, _rx) = ClientWriter::channel(4);
        writer
            .write_event(&SseEvent::message("ok"))
            .await
            .unwrap();
        writer.close();
        assert!(matches!(
            writer.write_event(&SseEvent::message("nope")).await,
            Err(GatewayError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn dropped_receiver_reads_as_disconnect() {
        let (writer, rx) = ClientWriter::channel(4);
        drop(rx);
        assert!(matches!(
            writer.write_event(&SseEvent::message("x")).await,
            Err(GatewayError::ClientDisconnect)
        ));
    }

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (writer, mut rx) = ClientWriter::channel(4);
        writer.write_event(&SseEvent::message("a")).await.unwrap();
        writer.write_event(&SseEvent::message("b")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from("event: message\ndata: a\n\n"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from("event: message\ndata: b\n\n"));
    }
}
