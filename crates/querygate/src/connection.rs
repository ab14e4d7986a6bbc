use crate::config::GatewayConfig;
use crate::transport::{Inbound, TransportSink, TransportStream};
use crate::worker;
use crate::writer::FrameWriter;
use querygate_core::{GatewayError, QueryRequest, QueryResolver, QueryTask, TaskStatus};
use querygate_protocol::{ClientFrame, ServerFrame, decode_client_frame};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Entry in the active-stream index. Holding only the cancel handle keeps
/// cancellation decoupled from the worker that owns the task.
struct ActiveTask {
    cancel: CancellationToken,
}

/// State shared between a connection's read loop and its workers.
pub struct ConnectionState {
    pub id: Uuid,
    pub resolver: Arc<QueryResolver>,
    pub writer: FrameWriter,
    /// Cancelled when the transport goes away or the process shuts down.
    /// Every task token is a child of this one.
    pub token: CancellationToken,
    active: RwLock<HashMap<String, ActiveTask>>,
}

impl ConnectionState {
    /// Reserve `stream_id` in the active index. Fails without touching the
    /// index when the id is already live.
    fn reserve_stream(
        &self,
        stream_id: &str,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError> {
        let mut active = self.active.write().expect("active index poisoned");
        if active.contains_key(stream_id) {
            return Err(GatewayError::DuplicateStream(stream_id.to_string()));
        }
        active.insert(stream_id.to_string(), ActiveTask { cancel });
        Ok(())
    }

    /// Remove a stream from the index, returning its cancel handle.
    pub fn remove_stream(&self, stream_id: &str) -> Option<CancellationToken> {
        self.active
            .write()
            .expect("active index poisoned")
            .remove(stream_id)
            .map(|task| task.cancel)
    }

    pub fn active_count(&self) -> usize {
        self.active.read().expect("active index poisoned").len()
    }
}

/// Drive one connection to completion: spawn the worker pool, route
/// inbound frames, keep liveness, and tear everything down when the
/// transport closes or the root context is cancelled.
pub async fn run_connection(
    resolver: Arc<QueryResolver>,
    config: &GatewayConfig,
    root: CancellationToken,
    sink: Box<dyn TransportSink>,
    mut stream: Box<dyn TransportStream>,
) {
    let id = Uuid::new_v4();
    let token = root.child_token();
    let writer = FrameWriter::new(sink, config.write_deadline());

    let state = Arc::new(ConnectionState {
        id,
        resolver,
        writer: writer.clone(),
        token: token.clone(),
        active: RwLock::new(HashMap::new()),
    });

    let (queue_tx, queue_rx) = mpsc::channel::<QueryTask>(config.queue_capacity.max(1));
    let queue_rx = Arc::new(Mutex::new(queue_rx));

    let mut workers = JoinSet::new();
    for worker_id in 0..config.max_workers.max(1) {
        workers.spawn(worker::worker_loop(
            worker_id,
            state.clone(),
            queue_rx.clone(),
        ));
    }

    log::info!(
        "[WS] Connection {} open ({} workers, queue capacity {})",
        id,
        config.max_workers.max(1),
        config.queue_capacity.max(1)
    );

    let read_deadline = config.read_deadline();
    let mut deadline = Instant::now() + read_deadline;
    let mut ping_ticker = tokio::time::interval(config.ping_interval());
    ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_ticker.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("[WS] Connection {} cancelled", id);
                break;
            }
            _ = tokio::time::sleep_until(deadline) => {
                log::warn!("[WS] Connection {} read deadline exceeded", id);
                break;
            }
            _ = ping_ticker.tick() => {
                if writer.send_ping().await.is_err() {
                    log::warn!("[WS] Connection {} ping write failed", id);
                    break;
                }
            }
            inbound = stream.recv() => match inbound {
                None | Some(Inbound::Close) => {
                    log::info!("[WS] Connection {} closed by peer", id);
                    break;
                }
                Some(Inbound::Pong) => {
                    deadline = Instant::now() + read_deadline;
                }
                Some(Inbound::Text(text)) => {
                    if text.len() > config.max_frame_size {
                        log::warn!(
                            "[WS] Connection {} frame of {} bytes exceeds limit {}, closing",
                            id,
                            text.len(),
                            config.max_frame_size
                        );
                        break;
                    }
                    if !handle_frame(&state, &queue_tx, &text).await {
                        break;
                    }
                }
            }
        }
    }

    teardown(&state, queue_tx, queue_rx, workers, config.shutdown_grace()).await;
}

/// Returns `false` when the frame is fatal to the transport.
async fn handle_frame(
    state: &Arc<ConnectionState>,
    queue_tx: &mpsc::Sender<QueryTask>,
    text: &str,
) -> bool {
    match decode_client_frame(text) {
        Ok(ClientFrame::Query {
            stream_id,
            query_id,
            template_data,
        }) => {
            admit_query(state, queue_tx, stream_id, query_id, template_data).await;
            true
        }
        Ok(ClientFrame::Cancel { stream_id }) => {
            cancel_stream(state, &stream_id).await;
            true
        }
        Err(decode_error) => match decode_error.stream_id {
            // Recoverable: the peer gave us a stream to answer on.
            Some(stream_id) => {
                log::warn!(
                    "[WS] Connection {} protocol error on stream {}: {}",
                    state.id,
                    stream_id,
                    decode_error.message
                );
                let _ = state
                    .writer
                    .send(&ServerFrame::protocol_error(stream_id, decode_error.message))
                    .await;
                true
            }
            None => {
                log::warn!(
                    "[WS] Connection {} unrecoverable protocol error: {}",
                    state.id,
                    decode_error.message
                );
                false
            }
        },
    }
}

/// Admission: validate, enforce stream-id uniqueness under the index lock,
/// then enqueue. The `status:queued` frame is written before the task can
/// reach a worker, so it always precedes `status:running`.
async fn admit_query(
    state: &Arc<ConnectionState>,
    queue_tx: &mpsc::Sender<QueryTask>,
    stream_id: String,
    query_id: String,
    template_data: serde_json::Value,
) {
    if stream_id.is_empty() || query_id.is_empty() {
        let err = GatewayError::InvalidRequest(
            "streamId and queryId must be non-empty".to_string(),
        );
        let _ = state.writer.send(&ServerFrame::error(stream_id, &err)).await;
        return;
    }

    let cancel = state.token.child_token();
    if let Err(err) = state.reserve_stream(&stream_id, cancel.clone()) {
        log::warn!(
            "[WS] Connection {} rejected duplicate stream {}",
            state.id,
            stream_id
        );
        let _ = state.writer.send(&ServerFrame::error(stream_id, &err)).await;
        return;
    }

    let _ = state
        .writer
        .send(&ServerFrame::status(&stream_id, TaskStatus::Queued))
        .await;

    let task = QueryTask::new(
        QueryRequest {
            stream_id: stream_id.clone(),
            query_id,
            template_data,
        },
        cancel.clone(),
    );

    match queue_tx.try_send(task) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            state.remove_stream(&stream_id);
            cancel.cancel();
            log::warn!(
                "[WS] Connection {} queue full, rejecting stream {}",
                state.id,
                stream_id
            );
            let err = GatewayError::QueueFull;
            let _ = state.writer.send(&ServerFrame::error(&stream_id, &err)).await;
            let _ = state
                .writer
                .send(&ServerFrame::status(&stream_id, TaskStatus::Failed))
                .await;
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            // Teardown already started; the stream never ran.
            state.remove_stream(&stream_id);
            cancel.cancel();
        }
    }
}

/// Cancel routing: fire the task's token and drop it from the index. The
/// owning worker emits `status:cancelled` once the stream and driver are
/// closed, so no frame can trail the terminal one.
async fn cancel_stream(state: &Arc<ConnectionState>, stream_id: &str) {
    match state.remove_stream(stream_id) {
        Some(cancel) => {
            log::info!(
                "[CANCEL] Connection {} cancelling stream {}",
                state.id,
                stream_id
            );
            cancel.cancel();
        }
        None => {
            // Already terminated (or never existed). Not fatal.
            log::debug!(
                "[CANCEL] Connection {} has no active stream {}",
                state.id,
                stream_id
            );
            let err = GatewayError::StreamNotFound(stream_id.to_string());
            let _ = state.writer.send(&ServerFrame::error(stream_id, &err)).await;
        }
    }
}

async fn teardown(
    state: &Arc<ConnectionState>,
    queue_tx: mpsc::Sender<QueryTask>,
    queue_rx: Arc<Mutex<mpsc::Receiver<QueryTask>>>,
    mut workers: JoinSet<()>,
    grace: Duration,
) {
    // Cancelling the connection token cancels every task token derived
    // from it; closing the queue lets idle workers drain out. Each worker
    // emits the terminal `status:cancelled` for the task it is holding.
    state.token.cancel();
    drop(queue_tx);

    let drained = tokio::time::timeout(grace, async {
        while workers.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        log::warn!(
            "[WS] Connection {} workers did not drain within {:?}, aborting",
            state.id,
            grace
        );
        workers.abort_all();
        while workers.join_next().await.is_some() {}
    }

    // Tasks still sitting in the queue never reached a worker; notify
    // their streams before the transport goes away.
    {
        let mut queue = queue_rx.lock().await;
        while let Ok(mut task) = queue.try_recv() {
            task.mark_cancelled();
            let stream_id = task.request.stream_id.clone();
            if state.remove_stream(&stream_id).is_some() {
                let _ = state
                    .writer
                    .send(&ServerFrame::status(&stream_id, TaskStatus::Cancelled))
                    .await;
            }
        }
    }

    state.writer.close().await;
    log::info!("[WS] Connection {} closed", state.id);
}
