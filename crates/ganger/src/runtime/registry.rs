//! Process-wide registry of constructible worker types.
//!
//! The embedding binary registers its worker constructors (directly, or
//! behind named module hooks resolved by `require` directives) before any
//! launcher document is executed. Construction resolves a type name and a
//! JSON argument list to a [`WorkerInstance`] exactly once; the role of the
//! instance is fixed from that point on.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::error::{Result, WorkerError};
use crate::roles::{EventedWorkerImpl, RawWorkerImpl, SharedWorkerImpl};

/// A constructed worker, tagged with its resolved role.
pub enum WorkerInstance {
    Raw(Box<dyn RawWorkerImpl>),
    Evented(Box<dyn EventedWorkerImpl>),
    Shared(Box<dyn SharedWorkerImpl>),
}

impl WorkerInstance {
    pub fn role_name(&self) -> &'static str {
        match self {
            WorkerInstance::Raw(_) => "raw",
            WorkerInstance::Evented(_) => "evented",
            WorkerInstance::Shared(_) => "shared",
        }
    }
}

impl std::fmt::Debug for WorkerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WorkerInstance")
            .field(&self.role_name())
            .finish()
    }
}

type Constructor = Box<dyn Fn(&[Value]) -> Result<WorkerInstance>>;
type ModuleHook = Box<dyn FnOnce(&mut WorkerRegistry)>;

/// Maps worker type names to constructors, and module names to hooks that
/// register more of them.
#[derive(Default)]
pub struct WorkerRegistry {
    constructors: HashMap<String, Constructor>,
    modules: HashMap<String, ModuleHook>,
    loaded: HashSet<String>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor under `name`, replacing any previous one.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        constructor: impl Fn(&[Value]) -> Result<WorkerInstance> + 'static,
    ) -> &mut Self {
        self.constructors.insert(name.into(), Box::new(constructor));
        self
    }

    pub fn register_raw<W, F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        W: RawWorkerImpl + 'static,
        F: Fn(&[Value]) -> Result<W> + 'static,
    {
        self.register(name, move |args| {
            Ok(WorkerInstance::Raw(Box::new(constructor(args)?)))
        })
    }

    pub fn register_evented<W, F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        W: EventedWorkerImpl + 'static,
        F: Fn(&[Value]) -> Result<W> + 'static,
    {
        self.register(name, move |args| {
            Ok(WorkerInstance::Evented(Box::new(constructor(args)?)))
        })
    }

    pub fn register_shared<W, F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        W: SharedWorkerImpl + 'static,
        F: Fn(&[Value]) -> Result<W> + 'static,
    {
        self.register(name, move |args| {
            Ok(WorkerInstance::Shared(Box::new(constructor(args)?)))
        })
    }

    /// Registers a module hook to be run by [`require`](Self::require).
    pub fn register_module(
        &mut self,
        name: impl Into<String>,
        hook: impl FnOnce(&mut WorkerRegistry) + 'static,
    ) -> &mut Self {
        self.modules.insert(name.into(), Box::new(hook));
        self
    }

    /// Runs the named module hook. Each module loads at most once;
    /// requiring it again is a no-op.
    pub fn require(&mut self, name: &str) -> Result<()> {
        if self.loaded.contains(name) {
            return Ok(());
        }
        let Some(hook) = self.modules.remove(name) else {
            return Err(WorkerError::Config(format!("unknown module {name:?}")));
        };
        hook(self);
        self.loaded.insert(name.to_owned());
        Ok(())
    }

    pub fn knows_type(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Resolves `name` and constructs an instance from the JSON arguments.
    pub fn construct(&self, name: &str, args: &[Value]) -> Result<WorkerInstance> {
        let Some(constructor) = self.constructors.get(name) else {
            return Err(WorkerError::Config(format!("unknown worker type {name:?}")));
        };
        constructor(args)
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("types", &self.constructors.keys().collect::<Vec<_>>())
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("loaded", &self.loaded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use ganger_wire::{Message, MessageChannel};
    use serde_json::json;

    use super::*;
    use crate::runtime::PeerHandle;

    struct Sleeper;

    #[async_trait(?Send)]
    impl RawWorkerImpl for Sleeper {
        async fn run(&mut self, _channel: MessageChannel) -> Result<()> {
            Ok(())
        }
    }

    struct Echo;

    impl EventedWorkerImpl for Echo {
        fn on_message(&mut self, _message: Message, _peer: &PeerHandle) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_construct_resolves_role_once() {
        let mut registry = WorkerRegistry::new();
        registry.register_raw("Sleeper", |_args| Ok(Sleeper));
        let instance = registry.construct("Sleeper", &[]).expect("construct");
        assert_eq!(instance.role_name(), "raw");
    }

    #[test]
    fn test_constructor_arguments_are_json() {
        let mut registry = WorkerRegistry::new();
        registry.register_evented("Echo", |args| {
            args.first()
                .and_then(Value::as_str)
                .ok_or_else(|| WorkerError::Config("Echo needs a prefix".into()))?;
            Ok(Echo)
        });

        assert!(registry.construct("Echo", &[json!("hi")]).is_ok());
        assert!(registry.construct("Echo", &[]).is_err());
    }

    #[test]
    fn test_unknown_type_is_a_config_error() {
        let registry = WorkerRegistry::new();
        let err = registry.construct("Nobody", &[]).expect_err("unknown");
        assert!(matches!(err, WorkerError::Config(_)));
    }

    #[test]
    fn test_require_runs_hooks_once() {
        let mut registry = WorkerRegistry::new();
        registry.register_module("sleepers", |registry| {
            registry.register_raw("Sleeper", |_args| Ok(Sleeper));
        });

        assert!(!registry.knows_type("Sleeper"));
        registry.require("sleepers").expect("require");
        assert!(registry.knows_type("Sleeper"));
        registry.require("sleepers").expect("second require");

        assert!(matches!(
            registry.require("missing"),
            Err(WorkerError::Config(_))
        ));
    }
}
