use crate::{
    Driver, DriverRegistry, GatewayError, MetadataStore, RowStream, StreamFrame, render_template,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Turns `(queryId, templateData)` into a live result stream.
///
/// Stateless and safe to share across workers; its only side effects are
/// two metadata-store reads and the backend session it opens on behalf of
/// the caller.
pub struct QueryResolver {
    store: Arc<dyn MetadataStore>,
    registry: Arc<DriverRegistry>,
}

impl QueryResolver {
    pub fn new(store: Arc<dyn MetadataStore>, registry: Arc<DriverRegistry>) -> Self {
        Self { store, registry }
    }

    /// Fetch the definition and connector, render the template, build and
    /// connect the driver, and begin streaming execution.
    ///
    /// Cancellation is observed at every suspension point and yields
    /// `GatewayError::Cancelled`. On any exit after the driver is built,
    /// cancellation included, the driver is closed before the result
    /// propagates. The caller owns the returned handle.
    pub async fn resolve(
        &self,
        query_id: &str,
        template_data: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<ResolvedQuery, GatewayError> {
        let definition = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            result = self.store.query_definition(query_id) => result?,
        }
        .ok_or_else(|| GatewayError::QueryNotFound(query_id.to_string()))?;

        let sql = render_template(&definition.content, template_data)?;

        let connector = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            result = self.store.connector_config(&definition.connector_id) => result?,
        }
        .ok_or_else(|| GatewayError::ConnectorNotFound(definition.connector_id.clone()))?;

        let mut driver = self.registry.build(&connector.kind, &connector.config)?;

        log::debug!(
            "[RESOLVE] query={} connector={} kind={}",
            query_id,
            connector.id,
            connector.kind
        );

        // From here on the driver owns a (possibly half-open) backend
        // session; every exit path must close it.
        let connected = tokio::select! {
            _ = cancel.cancelled() => None,
            result = driver.connect() => Some(result),
        };
        match connected {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                driver.close().await;
                return Err(e);
            }
            None => {
                driver.close().await;
                return Err(GatewayError::Cancelled);
            }
        }

        let queried = tokio::select! {
            _ = cancel.cancelled() => None,
            result = driver.query(&sql) => Some(result),
        };
        match queried {
            Some(Ok(stream)) => Ok(ResolvedQuery {
                stream,
                driver,
                closed: false,
            }),
            Some(Err(e)) => {
                driver.close().await;
                Err(e)
            }
            None => {
                driver.close().await;
                Err(GatewayError::Cancelled)
            }
        }
    }
}

/// A live stream plus the driver that owns its backend session.
///
/// `close` tears down the stream before the driver and is safe to call
/// multiple times.
pub struct ResolvedQuery {
    stream: Box<dyn RowStream>,
    driver: Box<dyn Driver>,
    closed: bool,
}

impl std::fmt::Debug for ResolvedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedQuery")
            .field("closed", &self.closed)
            .finish()
    }
}

impl ResolvedQuery {
    pub async fn next(&mut self) -> Result<Option<StreamFrame>, GatewayError> {
        self.stream.next().await
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stream.close().await;
        self.driver.close().await;
    }
}
