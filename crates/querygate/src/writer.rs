use crate::transport::TransportSink;
use querygate_core::GatewayError;
use querygate_protocol::ServerFrame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Serializes all outbound frames on one connection.
///
/// The mutex is the connection's write lock: it is held for exactly one
/// frame write, never across driver I/O, so concurrent workers produce a
/// totally ordered stream of whole frames.
#[derive(Clone)]
pub struct FrameWriter {
    sink: Arc<Mutex<Box<dyn TransportSink>>>,
    write_deadline: Duration,
}

impl FrameWriter {
    pub fn new(sink: Box<dyn TransportSink>, write_deadline: Duration) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            write_deadline,
        }
    }

    pub async fn send(&self, frame: &ServerFrame) -> Result<(), GatewayError> {
        // Serialize outside the lock; the critical section is the write.
        let text = serde_json::to_string(frame)
            .map_err(|e| GatewayError::Io(std::io::Error::other(format!("frame encode: {e}"))))?;

        let mut sink = self.sink.lock().await;
        tokio::time::timeout(self.write_deadline, sink.send_text(text))
            .await
            .map_err(|_| {
                GatewayError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write deadline exceeded",
                ))
            })?
    }

    pub async fn send_ping(&self) -> Result<(), GatewayError> {
        let mut sink = self.sink.lock().await;
        tokio::time::timeout(self.write_deadline, sink.send_ping())
            .await
            .map_err(|_| {
                GatewayError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write deadline exceeded",
                ))
            })?
    }

    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        sink.close().await;
    }
}
