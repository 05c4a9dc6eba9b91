//! The extensibility seam: a step-type tag dispatches to a handler
//! providing validate/snapshot/apply/compensate. Generalized from the
//! per-box-type `PackageManager` implementations (`boxes/dnf.rs` et
//! al.) collapsed into one async trait plus a runtime-registered
//! table, since this crate has no need for per-OS package-manager
//! selection logic, since only one step type (`apt_package`) talks to a
//! package manager at all.

use crate::error_handling::TxError;
use async_trait::async_trait;
use std::collections::HashMap;

/// The quadruple every step type must implement (data model §4.3).
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// The tag this handler is registered under, e.g. `"apt_package"`.
    fn tag(&self) -> &'static str;

    /// Pure shape/content check; must not perform any side effect.
    fn validate(&self, data: &serde_json::Value) -> Result<(), TxError>;

    /// Capture enough pre-image to undo a subsequent successful
    /// `apply`. Must include an explicit "absent before" marker when
    /// the pre-state doesn't exist.
    async fn snapshot(&self, data: &serde_json::Value) -> Result<serde_json::Value, TxError>;

    /// Attempt to achieve the target state described by `data`.
    async fn apply(&self, data: &serde_json::Value) -> Result<(), TxError>;

    /// Restore the pre-state captured by `snapshot`. Must tolerate
    /// partial application: if the change never took effect,
    /// compensate is a no-op success.
    async fn compensate(
        &self,
        data: &serde_json::Value,
        snapshot: &serde_json::Value,
    ) -> Result<(), TxError>;
}

/// Tag → handler dispatch table. Built once at manager construction
/// and shared for the process lifetime; handlers are injectable, so
/// tests can register in-memory fakes without touching the host
/// (design note, "handler injection for hermetic testing").
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Box<dyn StepHandler>) {
        self.handlers.insert(handler.tag().to_string(), handler);
    }

    pub fn get(&self, tag: &str) -> Result<&dyn StepHandler, TxError> {
        self.handlers
            .get(tag)
            .map(|h| h.as_ref())
            .ok_or_else(|| TxError::UnknownStepType {
                tag: tag.to_string(),
            })
    }

    /// The six handlers shipped out of the box (data model §4.3).
    pub fn with_builtin_handlers(config: &crate::config::TxConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(crate::handlers::apt_package::AptPackageHandler::new(
            config,
        )));
        registry.register(Box::new(crate::handlers::file_copy::FileCopyHandler::new(
            config,
        )));
        registry.register(Box::new(
            crate::handlers::systemd_service::SystemdServiceHandler::new(config),
        ));
        registry.register(Box::new(
            crate::handlers::user_management::UserManagementHandler::new(config),
        ));
        registry.register(Box::new(
            crate::handlers::custom_script::CustomScriptHandler::new(config),
        ));
        registry.register(Box::new(
            crate::handlers::ansible_playbook::AnsiblePlaybookHandler::new(config),
        ));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl StepHandler for EchoHandler {
        fn tag(&self) -> &'static str {
            "echo"
        }

        fn validate(&self, _data: &serde_json::Value) -> Result<(), TxError> {
            Ok(())
        }

        async fn snapshot(&self, _data: &serde_json::Value) -> Result<serde_json::Value, TxError> {
            Ok(json!({"absent": true}))
        }

        async fn apply(&self, _data: &serde_json::Value) -> Result<(), TxError> {
            Ok(())
        }

        async fn compensate(
            &self,
            _data: &serde_json::Value,
            _snapshot: &serde_json::Value,
        ) -> Result<(), TxError> {
            Ok(())
        }
    }

    #[test]
    fn unregistered_tag_is_an_error() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(TxError::UnknownStepType { .. })
        ));
    }

    #[tokio::test]
    async fn registered_handler_is_dispatchable() {
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(EchoHandler));

        let handler = registry.get("echo").unwrap();
        handler.apply(&json!({})).await.unwrap();
    }
}
