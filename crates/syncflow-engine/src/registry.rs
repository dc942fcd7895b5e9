//! Connector lookup by short name
//!
//! Sources and destinations are resolved once, when a job is built, from the
//! `kind` of their [`ConnectorRef`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::destination::{Destination, InMemoryDestination};
use crate::error::{SyncError, SyncResult};
use crate::source::{JsonlSource, Source};
use crate::supervisor::ConnectorRef;

pub trait SourceFactory: Send + Sync {
    fn create(&self, connector: &ConnectorRef) -> SyncResult<Arc<dyn Source>>;
}

pub trait DestinationFactory: Send + Sync {
    fn create(&self, connector: &ConnectorRef) -> SyncResult<Arc<dyn Destination>>;
}

impl<F> SourceFactory for F
where
    F: Fn(&ConnectorRef) -> SyncResult<Arc<dyn Source>> + Send + Sync,
{
    fn create(&self, connector: &ConnectorRef) -> SyncResult<Arc<dyn Source>> {
        self(connector)
    }
}

impl<F> DestinationFactory for F
where
    F: Fn(&ConnectorRef) -> SyncResult<Arc<dyn Destination>> + Send + Sync,
{
    fn create(&self, connector: &ConnectorRef) -> SyncResult<Arc<dyn Destination>> {
        self(connector)
    }
}

#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    sources: HashMap<String, Arc<dyn SourceFactory>>,
    destinations: HashMap<String, Arc<dyn DestinationFactory>>,
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("destinations", &self.destinations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `jsonl` file source
    ///
    /// The `jsonl` source reads `config.path`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_source("jsonl", |connector: &ConnectorRef| -> SyncResult<Arc<dyn Source>> {
            let path = connector
                .config
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| SyncError::Configuration("jsonl source needs config.path".into()))?;
            let source: Arc<dyn Source> = Arc::new(JsonlSource::new("jsonl", path));
            Ok(source)
        });
        registry
    }

    pub fn register_source(&mut self, kind: impl Into<String>, factory: impl SourceFactory + 'static) {
        self.sources.insert(kind.into(), Arc::new(factory));
    }

    pub fn register_destination(
        &mut self,
        kind: impl Into<String>,
        factory: impl DestinationFactory + 'static,
    ) {
        self.destinations.insert(kind.into(), Arc::new(factory));
    }

    /// Register one shared in-memory destination under `kind`
    pub fn register_memory_destination(&mut self, kind: impl Into<String>, destination: Arc<InMemoryDestination>) {
        self.register_destination(kind, move |_: &ConnectorRef| -> SyncResult<Arc<dyn Destination>> {
            let destination: Arc<dyn Destination> = destination.clone();
            Ok(destination)
        });
    }

    pub fn resolve_source(&self, connector: &ConnectorRef) -> SyncResult<Arc<dyn Source>> {
        self.sources
            .get(&connector.kind)
            .ok_or_else(|| SyncError::Configuration(format!("unknown source '{}'", connector.kind)))?
            .create(connector)
    }

    pub fn resolve_destination(&self, connector: &ConnectorRef) -> SyncResult<Arc<dyn Destination>> {
        self.destinations
            .get(&connector.kind)
            .ok_or_else(|| {
                SyncError::Configuration(format!("unknown destination '{}'", connector.kind))
            })?
            .create(connector)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_builtin_source() {
        let registry = ConnectorRegistry::with_builtins();
        let connector = ConnectorRef::new("jsonl").with_config(json!({"path": "records.jsonl"}));
        assert_eq!(registry.resolve_source(&connector).unwrap().name(), "jsonl");

        let missing_path = ConnectorRef::new("jsonl");
        assert!(matches!(
            registry.resolve_source(&missing_path),
            Err(SyncError::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_connectors_are_configuration_errors() {
        let registry = ConnectorRegistry::new();
        assert!(matches!(
            registry.resolve_source(&ConnectorRef::new("salesforce")),
            Err(SyncError::Configuration(_))
        ));
        assert!(matches!(
            registry.resolve_destination(&ConnectorRef::new("qdrant")),
            Err(SyncError::Configuration(_))
        ));
    }

    #[test]
    fn test_memory_destination_is_shared() {
        let memory = Arc::new(InMemoryDestination::new(384));
        let mut registry = ConnectorRegistry::new();
        registry.register_memory_destination("memory", memory);

        let a = registry.resolve_destination(&ConnectorRef::new("memory")).unwrap();
        let b = registry.resolve_destination(&ConnectorRef::new("memory")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
