//! Driver registry: instrument type id to driver factory.
//!
//! Drivers are registered once at startup by the composition root. Lookup keys are
//! [`InstrumentTypeId::normalized`], so `"niDMM"`, `"NIDMM"` and `"nidmm"` name the same
//! driver on both registration and lookup.

use dashmap::DashMap;
use hal_core::{
    Capability, DriverComponents, DriverFactory, FactoryRegistry, HalError, HalResult,
    InstrumentTypeId,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Introspection record for a registered factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactoryInfo {
    /// Instrument type the factory serves
    pub instrument_type_id: String,
    /// Human-readable driver name
    pub name: String,
    /// Capabilities every built driver exposes
    pub capabilities: Vec<Capability>,
}

/// Zero-argument constructor returned by [`DriverRegistry::resolve`].
///
/// Each [`construct`](Self::construct) call yields a fresh, uninitialized driver.
#[derive(Clone)]
pub struct DriverConstructor {
    factory: Arc<dyn DriverFactory>,
}

impl DriverConstructor {
    /// Build a fresh, uninitialized driver.
    pub fn construct(&self) -> DriverComponents {
        self.factory.build()
    }

    /// Instrument type this constructor builds.
    pub fn instrument_type_id(&self) -> &'static str {
        self.factory.instrument_type_id()
    }

    /// Human-readable driver name.
    pub fn name(&self) -> &'static str {
        self.factory.name()
    }

    /// Capabilities of the built driver.
    pub fn capabilities(&self) -> &'static [Capability] {
        self.factory.capabilities()
    }
}

impl fmt::Debug for DriverConstructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConstructor")
            .field("instrument_type_id", &self.instrument_type_id())
            .finish()
    }
}

/// Registration table of driver factories.
#[derive(Default)]
pub struct DriverRegistry {
    factories: DashMap<String, Arc<dyn DriverFactory>>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver factory.
    ///
    /// Returns the factory previously registered under the same id, if any.
    pub fn register_factory(
        &self,
        factory: Box<dyn DriverFactory>,
    ) -> Option<Arc<dyn DriverFactory>> {
        let id = InstrumentTypeId::new(factory.instrument_type_id());
        tracing::info!(
            instrument_type_id = %id,
            name = %factory.name(),
            capabilities = ?factory.capabilities(),
            "Registering driver factory"
        );
        let previous = self.factories.insert(id.normalized(), Arc::from(factory));
        if previous.is_some() {
            tracing::warn!(instrument_type_id = %id, "Replaced existing driver factory");
        }
        previous
    }

    /// Unregister a driver factory.
    pub fn unregister_factory(&self, instrument_type_id: &str) -> Option<Arc<dyn DriverFactory>> {
        self.factories
            .remove(&InstrumentTypeId::new(instrument_type_id).normalized())
            .map(|(_, factory)| factory)
    }

    /// Whether a factory is registered for `instrument_type_id`.
    pub fn has_factory(&self, instrument_type_id: &str) -> bool {
        self.factories
            .contains_key(&InstrumentTypeId::new(instrument_type_id).normalized())
    }

    /// Registered instrument type ids, sorted, in their registered spelling.
    pub fn list_factories(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .factories
            .iter()
            .map(|entry| entry.value().instrument_type_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Metadata for the factory registered under `instrument_type_id`.
    pub fn factory_info(&self, instrument_type_id: &str) -> Option<FactoryInfo> {
        self.factories
            .get(&InstrumentTypeId::new(instrument_type_id).normalized())
            .map(|entry| {
                let factory = entry.value();
                FactoryInfo {
                    instrument_type_id: factory.instrument_type_id().to_string(),
                    name: factory.name().to_string(),
                    capabilities: factory.capabilities().to_vec(),
                }
            })
    }

    /// Number of registered factories.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether no factory is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Resolve an instrument type id to its driver constructor.
    ///
    /// # Errors
    /// - [`HalError::InvalidInstrumentTypeId`] for an empty or blank id
    /// - [`HalError::UnknownInstrumentType`] when no factory is registered; nothing is built
    pub fn resolve(&self, instrument_type_id: &InstrumentTypeId) -> HalResult<DriverConstructor> {
        if instrument_type_id.is_blank() {
            return Err(HalError::InvalidInstrumentTypeId);
        }
        match self.factories.get(&instrument_type_id.normalized()) {
            Some(entry) => Ok(DriverConstructor {
                factory: Arc::clone(entry.value()),
            }),
            None => {
                tracing::warn!(
                    instrument_type_id = %instrument_type_id,
                    "No driver registered for instrument type"
                );
                Err(HalError::UnknownInstrumentType {
                    instrument_type_id: instrument_type_id.to_string(),
                    available: self.list_factories(),
                })
            }
        }
    }
}

impl FactoryRegistry for DriverRegistry {
    fn register_factory(&self, factory: Box<dyn DriverFactory>) {
        DriverRegistry::register_factory(self, factory);
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("factories", &self.list_factories())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hal_core::{DriverError, Initializable, InitializeParams};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct IdleDriver;

    #[async_trait]
    impl Initializable for IdleDriver {
        async fn initialize(&self, _params: InitializeParams<'_>) -> Result<(), DriverError> {
            Ok(())
        }

        async fn release(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    struct TestFactory {
        id: &'static str,
        builds: Arc<AtomicUsize>,
    }

    impl TestFactory {
        fn new(id: &'static str) -> (Box<Self>, Arc<AtomicUsize>) {
            let builds = Arc::new(AtomicUsize::new(0));
            (
                Box::new(Self {
                    id,
                    builds: builds.clone(),
                }),
                builds,
            )
        }
    }

    impl DriverFactory for TestFactory {
        fn instrument_type_id(&self) -> &'static str {
            self.id
        }

        fn name(&self) -> &'static str {
            "Test Driver"
        }

        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::Initializable]
        }

        fn build(&self) -> DriverComponents {
            self.builds.fetch_add(1, Ordering::SeqCst);
            DriverComponents::new(Arc::new(IdleDriver))
        }
    }

    #[test]
    fn resolve_is_case_insensitive() {
        let registry = DriverRegistry::new();
        let (factory, _) = TestFactory::new("niDMM");
        registry.register_factory(factory);

        assert!(registry.has_factory("NIDMM"));
        let constructor = registry.resolve(&"nidmm".into()).unwrap();
        assert_eq!(constructor.instrument_type_id(), "niDMM");
        assert_eq!(registry.list_factories(), vec!["niDMM".to_string()]);
    }

    #[test]
    fn unknown_type_never_builds() {
        let registry = DriverRegistry::new();
        let (factory, builds) = TestFactory::new("niDMM");
        registry.register_factory(factory);

        let err = registry.resolve(&"niScope".into()).unwrap_err();
        match err {
            HalError::UnknownInstrumentType {
                instrument_type_id,
                available,
            } => {
                assert_eq!(instrument_type_id, "niScope");
                assert_eq!(available, vec!["niDMM".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(builds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn blank_id_is_rejected() {
        let registry = DriverRegistry::new();
        assert!(matches!(
            registry.resolve(&" ".into()),
            Err(HalError::InvalidInstrumentTypeId)
        ));
    }

    #[test]
    fn resolve_is_idempotent() {
        let registry = DriverRegistry::new();
        let (factory, builds) = TestFactory::new("niDCPower");
        registry.register_factory(factory);

        let first = registry.resolve(&"niDCPower".into()).unwrap();
        let second = registry.resolve(&"niDCPower".into()).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 0);

        let a = first.construct();
        let b = second.construct();
        assert_eq!(a.capabilities(), b.capabilities());
        assert!(!Arc::ptr_eq(&a.initializable, &b.initializable));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn register_replaces_and_unregister_removes() {
        let registry = DriverRegistry::new();
        let (first, _) = TestFactory::new("KeysightDMM");
        let (second, _) = TestFactory::new("keysightdmm");
        assert!(registry.register_factory(first).is_none());
        assert!(registry.register_factory(second).is_some());
        assert_eq!(registry.len(), 1);

        let info = registry.factory_info("KEYSIGHTDMM").unwrap();
        assert_eq!(info.instrument_type_id, "keysightdmm");
        assert_eq!(info.capabilities, vec![Capability::Initializable]);

        assert!(registry.unregister_factory("KeysightDMM").is_some());
        assert!(registry.is_empty());
    }
}
