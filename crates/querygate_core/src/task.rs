use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a streaming query task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Queued | TaskStatus::Running)
    }

    /// Lowercase name used in `status` frames.
    pub fn wire_name(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// One admitted `query` frame.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Caller-assigned stream id, unique per connection while active.
    pub stream_id: String,
    pub query_id: String,
    pub template_data: serde_json::Value,
}

/// A query execution owned by the connection that admitted it.
///
/// Created `Queued` on admission; a worker moves it to `Running` and then
/// to exactly one terminal state. There are no transitions out of a
/// terminal state.
pub struct QueryTask {
    pub request: QueryRequest,
    status: TaskStatus,
    executed_at: Option<Instant>,
    cancel: CancellationToken,
}

impl QueryTask {
    pub fn new(request: QueryRequest, cancel: CancellationToken) -> Self {
        Self {
            request,
            status: TaskStatus::Queued,
            executed_at: None,
            cancel,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn executed_at(&self) -> Option<Instant> {
        self.executed_at
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Queued → Running`; stamps `executed_at`.
    pub fn mark_running(&mut self) {
        if self.status == TaskStatus::Queued {
            self.status = TaskStatus::Running;
            self.executed_at = Some(Instant::now());
        }
    }

    pub fn mark_completed(&mut self) {
        self.enter_terminal(TaskStatus::Completed);
    }

    pub fn mark_failed(&mut self) {
        self.enter_terminal(TaskStatus::Failed);
    }

    pub fn mark_cancelled(&mut self) {
        self.enter_terminal(TaskStatus::Cancelled);
    }

    fn enter_terminal(&mut self, terminal: TaskStatus) {
        if !self.status.is_terminal() {
            self.status = terminal;
        }
    }
}
