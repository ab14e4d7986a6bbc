use crate::{Driver, GatewayError};
use std::collections::HashMap;

/// Builds a driver from a connector's opaque config blob.
///
/// Factories validate the blob and construct the driver without performing
/// any I/O; the backend session is only opened by `Driver::connect`.
pub type DriverFactory =
    Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn Driver>, GatewayError> + Send + Sync>;

/// Process-wide mapping from backend-type tag to driver factory.
///
/// Populated once at startup via [`DriverRegistryBuilder`] and read-only
/// afterwards, so lookups need no locking.
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    pub fn builder() -> DriverRegistryBuilder {
        DriverRegistryBuilder {
            factories: HashMap::new(),
        }
    }

    /// Build a driver for `kind` from its config blob.
    pub fn build(
        &self,
        kind: &str,
        config: &serde_json::Value,
    ) -> Result<Box<dyn Driver>, GatewayError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| GatewayError::UnsupportedBackend(kind.to_string()))?;
        factory(config)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

pub struct DriverRegistryBuilder {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistryBuilder {
    /// Register a factory for a backend-type tag. Later registrations for
    /// the same tag replace earlier ones.
    pub fn register(
        mut self,
        kind: impl Into<String>,
        factory: impl Fn(&serde_json::Value) -> Result<Box<dyn Driver>, GatewayError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        let kind = kind.into();
        log::debug!("[REGISTRY] Registered driver factory: {}", kind);
        self.factories.insert(kind, Box::new(factory));
        self
    }

    pub fn build(self) -> DriverRegistry {
        DriverRegistry {
            factories: self.factories,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RowStream, StreamFrame};
    use async_trait::async_trait;

    struct NopDriver;

    #[async_trait]
    impl Driver for NopDriver {
        async fn connect(&mut self) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn query(&mut self, _sql: &str) -> Result<Box<dyn RowStream>, GatewayError> {
            Ok(Box::new(EmptyStream))
        }

        async fn close(&mut self) {}
    }

    struct EmptyStream;

    #[async_trait]
    impl RowStream for EmptyStream {
        async fn next(&mut self) -> Result<Option<StreamFrame>, GatewayError> {
            Ok(None)
        }

        async fn close(&mut self) {}
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let registry = DriverRegistry::builder().build();
        let err = registry
            .build("voltdb", &serde_json::json!({}))
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::UnsupportedBackend(k) if k == "voltdb"));
    }

    #[test]
    fn registered_factory_is_invoked() {
        let registry = DriverRegistry::builder()
            .register("nop", |_| Ok(Box::new(NopDriver) as Box<dyn Driver>))
            .build();

        assert!(registry.contains("nop"));
        assert!(!registry.contains("postgres"));
        assert!(registry.build("nop", &serde_json::json!({})).is_ok());
    }

    #[test]
    fn factory_validation_errors_propagate() {
        let registry = DriverRegistry::builder()
            .register("strict", |config| {
                if config.get("host").is_none() {
                    return Err(GatewayError::invalid_config("missing field: host"));
                }
                Ok(Box::new(NopDriver) as Box<dyn Driver>)
            })
            .build();

        let err = registry
            .build("strict", &serde_json::json!({}))
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }
}
