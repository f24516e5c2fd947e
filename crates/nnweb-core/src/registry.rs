//! Mapping from backend kinds to runner factories.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use nnweb_runtime::{
    BackendKind, FallbackRunner, GpuRunner, KernelTable, Runner, RunnerContext, RuntimeError,
};
use serde_json::Value;

use crate::error::ConfigError;
use crate::probe::Environment;

type AvailabilityCheck = Rc<dyn Fn(&Environment) -> bool>;
type Constructed = Result<Box<dyn Runner>, RuntimeError>;
type Constructor = Rc<dyn Fn(&RunnerContext, &Environment, &Value) -> Constructed>;

/// How to probe for and construct one kind of runner.
#[derive(Clone)]
pub struct RunnerFactory {
    check_availability: AvailabilityCheck,
    construct: Constructor,
}

impl RunnerFactory {
    pub fn new(
        check_availability: impl Fn(&Environment) -> bool + 'static,
        construct: impl Fn(&RunnerContext, &Environment, &Value) -> Constructed + 'static,
    ) -> Self {
        Self {
            check_availability: Rc::new(check_availability),
            construct: Rc::new(construct),
        }
    }

    /// Whether the environment offers what this backend needs.
    pub fn is_available(&self, env: &Environment) -> bool {
        (self.check_availability)(env)
    }

    /// Build an uninitialized runner from the kind's option blob.
    pub fn construct(
        &self,
        context: &RunnerContext,
        env: &Environment,
        option: &Value,
    ) -> Result<Box<dyn Runner>, RuntimeError> {
        (self.construct)(context, env, option)
    }
}

impl fmt::Debug for RunnerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RunnerFactory")
    }
}

/// Backend kinds known to a dispatcher.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    factories: BTreeMap<BackendKind, RunnerFactory>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every backend compiled into this build.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register(
            BackendKind::Gpu,
            RunnerFactory::new(
                |env| env.gpu.is_some(),
                |context, env, _option| {
                    let adapter = env.gpu.clone().ok_or_else(|| {
                        RuntimeError::DeviceUnavailable("no GPU adapter in this environment".into())
                    })?;
                    Ok(Box::new(GpuRunner::new(adapter, context.clone())) as Box<dyn Runner>)
                },
            ),
        );

        #[cfg(feature = "bytecode")]
        registry.register(
            BackendKind::Bytecode,
            RunnerFactory::new(
                |env| env.bytecode_vm,
                |context, _env, option| {
                    let options = nnweb_runtime::BytecodeOptions::from_value(option)?;
                    let runner = nnweb_runtime::BytecodeRunner::new(context.clone(), options);
                    Ok(Box::new(runner) as Box<dyn Runner>)
                },
            ),
        );

        registry.register(
            BackendKind::Fallback,
            RunnerFactory::new(
                |_env| true,
                |context, _env, _option| {
                    let runner = FallbackRunner::new(context.clone(), KernelTable::reference());
                    Ok(Box::new(runner) as Box<dyn Runner>)
                },
            ),
        );

        registry
    }

    /// Add or replace the factory for `kind`.
    pub fn register(&mut self, kind: BackendKind, factory: RunnerFactory) -> &mut Self {
        self.factories.insert(kind, factory);
        self
    }

    pub fn factory(&self, kind: BackendKind) -> Result<&RunnerFactory, ConfigError> {
        self.factories.get(&kind).ok_or(ConfigError::UnregisteredBackend(kind))
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        self.factories.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnweb_runtime::MemoryFetcher;

    fn context() -> RunnerContext {
        RunnerContext::new(Rc::new(MemoryFetcher::new()))
    }

    #[test]
    fn test_defaults_register_compiled_backends() {
        let registry = Registry::with_defaults();
        assert!(registry.contains(BackendKind::Gpu));
        assert!(registry.contains(BackendKind::Fallback));
        assert_eq!(registry.contains(BackendKind::Bytecode), cfg!(feature = "bytecode"));
    }

    #[test]
    fn test_unregistered_lookup_is_config_error() {
        let registry = Registry::new();
        assert!(matches!(
            registry.factory(BackendKind::Gpu),
            Err(ConfigError::UnregisteredBackend(BackendKind::Gpu))
        ));
    }

    #[test]
    fn test_gpu_needs_adapter() {
        let registry = Registry::with_defaults();
        let factory = registry.factory(BackendKind::Gpu).unwrap();
        let env = Environment::bare();

        assert!(!factory.is_available(&env));
        assert!(matches!(
            factory.construct(&context(), &env, &Value::Null),
            Err(RuntimeError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_fallback_constructs_in_bare_environment() {
        let registry = Registry::with_defaults();
        let factory = registry.factory(BackendKind::Fallback).unwrap();
        let env = Environment::bare();

        assert!(factory.is_available(&env));
        let runner = factory.construct(&context(), &env, &Value::Null).unwrap();
        assert_eq!(runner.backend_name(), "fallback");
    }

    #[cfg(feature = "bytecode")]
    #[test]
    fn test_bytecode_rejects_malformed_options() {
        let registry = Registry::with_defaults();
        let factory = registry.factory(BackendKind::Bytecode).unwrap();
        let option = serde_json::json!({"input_shapes": "not a list"});

        assert!(matches!(
            factory.construct(&context(), &Environment::native(), &option),
            Err(RuntimeError::Options(_))
        ));
    }

    #[test]
    fn test_register_replaces_factory() {
        let mut registry = Registry::with_defaults();
        registry.register(
            BackendKind::Fallback,
            RunnerFactory::new(
                |_env| false,
                |_context, _env, _option| Err(RuntimeError::DeviceUnavailable("disabled".into())),
            ),
        );

        let factory = registry.factory(BackendKind::Fallback).unwrap();
        assert!(!factory.is_available(&Environment::bare()));
    }
}
