use crate::connection::ConnectionState;
use querygate_core::{GatewayError, QueryTask, StreamFrame, TaskStatus};
use querygate_protocol::ServerFrame;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

enum Outcome {
    Completed(u64),
    Failed(GatewayError),
    Cancelled,
    /// Transport gone mid-stream; nothing more can be written.
    Disconnected,
}

/// One cooperative worker: pulls tasks from the connection's queue until
/// the queue closes or the connection is cancelled.
pub async fn worker_loop(
    worker_id: usize,
    state: Arc<ConnectionState>,
    queue: Arc<Mutex<mpsc::Receiver<QueryTask>>>,
) {
    loop {
        let task = {
            let mut queue = queue.lock().await;
            tokio::select! {
                _ = state.token.cancelled() => None,
                task = queue.recv() => task,
            }
        };

        let Some(mut task) = task else {
            break;
        };
        run_task(worker_id, &state, &mut task).await;
    }

    log::debug!(
        "[WORKER] Connection {} worker {} exiting",
        state.id,
        worker_id
    );
}

/// Drive one task from `queued` to a terminal state, emitting its frames.
///
/// Every frame of the stream goes through this worker, so per-stream
/// ordering is plain program order: `status:running`, `metadata`, rows,
/// then exactly one terminal.
async fn run_task(worker_id: usize, state: &Arc<ConnectionState>, task: &mut QueryTask) {
    let stream_id = task.request.stream_id.clone();
    let cancel = task.cancel_token().clone();

    // Cancelled while still queued: it never ran, and the cancel handler
    // already dropped it from the index.
    if cancel.is_cancelled() {
        task.mark_cancelled();
        finish(state, task, &stream_id, Outcome::Cancelled).await;
        return;
    }

    task.mark_running();
    log::debug!(
        "[WORKER] Connection {} worker {} running stream {} (query {})",
        state.id,
        worker_id,
        stream_id,
        task.request.query_id
    );

    if state
        .writer
        .send(&ServerFrame::status(&stream_id, TaskStatus::Running))
        .await
        .is_err()
    {
        task.mark_failed();
        finish(state, task, &stream_id, Outcome::Disconnected).await;
        return;
    }

    // The resolver observes the token itself and closes any driver it has
    // already built before reporting cancellation, so no backend session
    // can leak out of a cancelled resolve.
    let resolved = state
        .resolver
        .resolve(&task.request.query_id, &task.request.template_data, &cancel)
        .await;

    let mut handle = match resolved {
        Err(GatewayError::Cancelled) => {
            task.mark_cancelled();
            finish(state, task, &stream_id, Outcome::Cancelled).await;
            return;
        }
        Err(e) => {
            task.mark_failed();
            finish(state, task, &stream_id, Outcome::Failed(e)).await;
            return;
        }
        Ok(handle) => handle,
    };

    let mut total_rows: u64 = 0;
    let outcome = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break Outcome::Cancelled,
            frame = handle.next() => frame,
        };

        match frame {
            Ok(Some(StreamFrame::Header(columns))) => {
                if state
                    .writer
                    .send(&ServerFrame::metadata(&stream_id, columns))
                    .await
                    .is_err()
                {
                    break Outcome::Disconnected;
                }
            }
            Ok(Some(StreamFrame::Row(row))) => {
                // The write completes before the next row is pulled from
                // the driver; a slow client therefore throttles the
                // backend read. Memory per stream stays one frame.
                if state
                    .writer
                    .send(&ServerFrame::row(&stream_id, &row))
                    .await
                    .is_err()
                {
                    break Outcome::Disconnected;
                }
                total_rows += 1;
            }
            Ok(None) => break Outcome::Completed(total_rows),
            Err(e) => break Outcome::Failed(e),
        }
    };

    // The stream and driver are fully closed before the terminal frames
    // go out, so a consumer that saw the terminal can rely on the backend
    // cursor being released.
    handle.close().await;

    match &outcome {
        Outcome::Completed(_) => task.mark_completed(),
        Outcome::Failed(_) | Outcome::Disconnected => task.mark_failed(),
        Outcome::Cancelled => task.mark_cancelled(),
    }

    finish(state, task, &stream_id, outcome).await;
}

async fn finish(
    state: &Arc<ConnectionState>,
    task: &QueryTask,
    stream_id: &str,
    outcome: Outcome,
) {
    debug_assert!(task.status().is_terminal());

    // Drop the stream from the index before the terminal frames go out:
    // once a client has seen the terminal it may reuse the id, and a late
    // cancel must get StreamNotFound rather than a stale handle.
    state.remove_stream(stream_id);

    match outcome {
        Outcome::Completed(total_rows) => {
            let completed = state
                .writer
                .send(&ServerFrame::complete(stream_id, total_rows))
                .await
                .is_ok()
                && state
                    .writer
                    .send(&ServerFrame::status(stream_id, TaskStatus::Completed))
                    .await
                    .is_ok();
            if !completed {
                state.token.cancel();
            }
            log::debug!(
                "[WORKER] Connection {} stream {} completed ({} rows)",
                state.id,
                stream_id,
                total_rows
            );
        }
        Outcome::Failed(error) => {
            log::warn!(
                "[WORKER] Connection {} stream {} failed: {} (retryable: {})",
                state.id,
                stream_id,
                error,
                error.is_retryable()
            );
            let sent = state
                .writer
                .send(&ServerFrame::error(stream_id, &error))
                .await
                .is_ok()
                && state
                    .writer
                    .send(&ServerFrame::status(stream_id, TaskStatus::Failed))
                    .await
                    .is_ok();
            if !sent {
                state.token.cancel();
            }
        }
        Outcome::Cancelled => {
            // Legitimate cancellation emits only the status frame, and only
            // after stream/driver teardown above. This holds during
            // connection-wide unwinds too: the writer stays open until the
            // workers drain, so the terminal still reaches the peer before
            // the transport shuts.
            let _ = state
                .writer
                .send(&ServerFrame::status(stream_id, TaskStatus::Cancelled))
                .await;
            log::debug!(
                "[WORKER] Connection {} stream {} cancelled",
                state.id,
                stream_id
            );
        }
        Outcome::Disconnected => {
            // No transport left to notify; make sure the rest of the
            // connection unwinds too.
            state.token.cancel();
        }
    }
}
