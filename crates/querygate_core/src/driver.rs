use crate::{GatewayError, Row};
use async_trait::async_trait;

/// One frame pulled from a [`RowStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Column names, yielded exactly once before any row.
    Header(Vec<String>),
    /// One row of portable values, in backend-native order.
    Row(Row),
}

/// Lazy, finite, single-shot sequence of result frames.
///
/// The first successful `next` yields `StreamFrame::Header`; subsequent
/// calls yield rows until `Ok(None)` marks the end. After the stream ends
/// or errors it yields no further frames. `close` releases the backend
/// cursor and must be safe on every exit path, including after an error
/// and when the consumer stops early.
#[async_trait]
pub trait RowStream: Send {
    async fn next(&mut self) -> Result<Option<StreamFrame>, GatewayError>;

    /// Release the underlying cursor. Idempotent.
    async fn close(&mut self);
}

/// Uniform adapter to one backend family.
///
/// A driver exclusively owns one backend session; the worker that built it
/// is the sole mutator until `close`. Lifecycle:
/// `build → connect → (query → stream)* → close`.
#[async_trait]
pub trait Driver: Send {
    /// Establish and validate a live backend session.
    async fn connect(&mut self) -> Result<(), GatewayError>;

    /// Begin streaming execution of `sql`. The returned stream must not
    /// have materialized rows yet.
    async fn query(&mut self, sql: &str) -> Result<Box<dyn RowStream>, GatewayError>;

    /// Release the backend session. Idempotent; safe after partial connect.
    async fn close(&mut self);
}
