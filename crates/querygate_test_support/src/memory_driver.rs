use async_trait::async_trait;
use querygate_core::{Driver, GatewayError, Row, RowStream, StreamFrame};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct MemoryDriverStats {
    pub executed_sql: Vec<String>,
    pub connect_calls: usize,
    pub close_calls: usize,
    pub stream_close_calls: usize,
}

#[derive(Default)]
struct MemoryDriverState {
    columns: RwLock<Vec<String>>,
    rows: RwLock<Vec<Row>>,
    row_delay: RwLock<Option<Duration>>,
    connect_delay: RwLock<Option<Duration>>,
    query_delay: RwLock<Option<Duration>>,
    connect_error: RwLock<Option<String>>,
    query_error: RwLock<Option<String>>,
    fail_after: RwLock<Option<(usize, String)>>,
    executed_sql: Mutex<Vec<String>>,
    connect_calls: AtomicUsize,
    close_calls: AtomicUsize,
    stream_close_calls: AtomicUsize,
}

/// Scripted in-memory streaming driver.
///
/// Clones share state, so a test keeps one handle for assertions while the
/// registry factory hands clones to workers. Configure with the `with_*`
/// builders, then observe `stats()` after the run.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<MemoryDriverState>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(self, columns: Vec<&str>, rows: Vec<Row>) -> Self {
        *self.state.columns.write().unwrap() =
            columns.into_iter().map(str::to_string).collect();
        *self.state.rows.write().unwrap() = rows;
        self
    }

    /// Delay before each row frame, to simulate a slow backend.
    pub fn with_row_delay(self, delay: Duration) -> Self {
        *self.state.row_delay.write().unwrap() = Some(delay);
        self
    }

    /// Delay inside `connect`, to simulate a slow session handshake.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.state.connect_delay.write().unwrap() = Some(delay);
        self
    }

    /// Delay inside `query`, before the stream exists.
    pub fn with_query_delay(self, delay: Duration) -> Self {
        *self.state.query_delay.write().unwrap() = Some(delay);
        self
    }

    pub fn with_connect_error(self, message: impl Into<String>) -> Self {
        *self.state.connect_error.write().unwrap() = Some(message.into());
        self
    }

    pub fn with_query_error(self, message: impl Into<String>) -> Self {
        *self.state.query_error.write().unwrap() = Some(message.into());
        self
    }

    /// Stream fails after yielding `rows` row frames.
    pub fn with_failure_after(self, rows: usize, message: impl Into<String>) -> Self {
        *self.state.fail_after.write().unwrap() = Some((rows, message.into()));
        self
    }

    pub fn stats(&self) -> MemoryDriverStats {
        MemoryDriverStats {
            executed_sql: self.state.executed_sql.lock().unwrap().clone(),
            connect_calls: self.state.connect_calls.load(Ordering::SeqCst),
            close_calls: self.state.close_calls.load(Ordering::SeqCst),
            stream_close_calls: self.state.stream_close_calls.load(Ordering::SeqCst),
        }
    }

    /// Registry factory that hands out clones of this driver.
    pub fn factory(
        &self,
    ) -> impl Fn(&serde_json::Value) -> Result<Box<dyn Driver>, GatewayError>
    + Send
    + Sync
    + use<> {
        let this = self.clone();
        move |_config| Ok(Box::new(this.clone()) as Box<dyn Driver>)
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn connect(&mut self) -> Result<(), GatewayError> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.connect_delay.read().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.state.connect_error.read().unwrap().clone() {
            return Err(GatewayError::connect_failed(message));
        }
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Box<dyn RowStream>, GatewayError> {
        self.state.executed_sql.lock().unwrap().push(sql.to_string());
        let delay = *self.state.query_delay.read().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.state.query_error.read().unwrap().clone() {
            return Err(GatewayError::query_failed(message));
        }

        Ok(Box::new(MemoryRowStream {
            columns: Some(self.state.columns.read().unwrap().clone()),
            rows: self.state.rows.read().unwrap().iter().cloned().collect(),
            row_delay: *self.state.row_delay.read().unwrap(),
            fail_after: self.state.fail_after.read().unwrap().clone(),
            emitted_rows: 0,
            finished: false,
            state: self.state.clone(),
        }))
    }

    async fn close(&mut self) {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

struct MemoryRowStream {
    columns: Option<Vec<String>>,
    rows: VecDeque<Row>,
    row_delay: Option<Duration>,
    fail_after: Option<(usize, String)>,
    emitted_rows: usize,
    finished: bool,
    state: Arc<MemoryDriverState>,
}

#[async_trait]
impl RowStream for MemoryRowStream {
    async fn next(&mut self) -> Result<Option<StreamFrame>, GatewayError> {
        if self.finished {
            return Ok(None);
        }

        if let Some(columns) = self.columns.take() {
            return Ok(Some(StreamFrame::Header(columns)));
        }

        if let Some((limit, message)) = &self.fail_after
            && self.emitted_rows >= *limit
        {
            self.finished = true;
            return Err(GatewayError::stream_failed(message.clone()));
        }

        match self.rows.pop_front() {
            Some(row) => {
                if let Some(delay) = self.row_delay {
                    tokio::time::sleep(delay).await;
                }
                self.emitted_rows += 1;
                Ok(Some(StreamFrame::Row(row)))
            }
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) {
        self.finished = true;
        self.state.stream_close_calls.fetch_add(1, Ordering::SeqCst);
    }
}
