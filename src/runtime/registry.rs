use std::collections::HashMap;
use std::sync::Arc;

use super::definition::WorkflowDefinition;

/// Immutable table of workflow definitions, keyed by workflow type.
///
/// Cloning is cheap; runtimes and clients share one registry.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    inner: Arc<HashMap<String, Arc<WorkflowDefinition>>>,
}

pub struct WorkflowRegistryBuilder {
    map: HashMap<String, Arc<WorkflowDefinition>>,
    errors: Vec<String>,
}

impl WorkflowRegistry {
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, workflow_type: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner.get(workflow_type).cloned()
    }

    pub fn has(&self, workflow_type: &str) -> bool {
        self.inner.contains_key(workflow_type)
    }

    /// Initial state of `workflow_type`, if registered.
    pub fn initial_state_of(&self, workflow_type: &str) -> Option<String> {
        self.inner.get(workflow_type).map(|d| d.initial_state().to_string())
    }

    /// Registered workflow types, sorted.
    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("types", &self.list_types())
            .finish()
    }
}

impl WorkflowRegistryBuilder {
    pub fn register(mut self, definition: WorkflowDefinition) -> Self {
        self.insert(Arc::new(definition));
        self
    }

    pub fn register_arc(mut self, definition: Arc<WorkflowDefinition>) -> Self {
        self.insert(definition);
        self
    }

    pub fn register_all<I>(mut self, definitions: I) -> Self
    where
        I: IntoIterator<Item = WorkflowDefinition>,
    {
        for definition in definitions {
            self.insert(Arc::new(definition));
        }
        self
    }

    /// Register the outcome of [`WorkflowDefinitionBuilder::build`](super::definition::WorkflowDefinitionBuilder::build),
    /// keeping a failed build as a registration error.
    pub fn register_result(mut self, definition: Result<WorkflowDefinition, String>) -> Self {
        match definition {
            Ok(definition) => self.insert(Arc::new(definition)),
            Err(e) => self.errors.push(e),
        }
        self
    }

    /// Merge another registry into this builder.
    pub fn merge(mut self, other: &WorkflowRegistry) -> Self {
        for definition in other.inner.values() {
            self.insert(definition.clone());
        }
        self
    }

    fn insert(&mut self, definition: Arc<WorkflowDefinition>) {
        let workflow_type = definition.workflow_type().to_string();
        if self.map.contains_key(&workflow_type) {
            self.errors
                .push(format!("duplicate workflow registration: {workflow_type}"));
        } else {
            self.map.insert(workflow_type, definition);
        }
    }

    /// Build ignoring registration errors; the first registration of a type wins.
    pub fn build(self) -> WorkflowRegistry {
        WorkflowRegistry {
            inner: Arc::new(self.map),
        }
    }

    /// Build the registry, returning an error if there were any registration errors.
    ///
    /// # Errors
    ///
    /// Returns an error string containing all registration errors.
    pub fn build_result(self) -> Result<WorkflowRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::definition::{NextAction, StateType};

    fn definition(workflow_type: &str) -> WorkflowDefinition {
        WorkflowDefinition::builder(workflow_type)
            .register_state("begin", StateType::Start)
            .register_state("done", StateType::End)
            .initial_state("begin")
            .error_state("done")
            .permit("begin", "done")
            .on_state("begin", |_ctx| async { Ok(NextAction::move_to_state("done", "ok")) })
            .build()
            .unwrap()
    }

    #[test]
    fn test_lookup_by_type() {
        let registry = WorkflowRegistry::builder()
            .register(definition("b"))
            .register(definition("a"))
            .build_result()
            .unwrap();
        assert!(registry.has("a"));
        assert!(!registry.has("c"));
        assert_eq!(registry.list_types(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.initial_state_of("a").as_deref(), Some("begin"));
        assert_eq!(registry.get("b").unwrap().workflow_type(), "b");
    }

    #[test]
    fn test_duplicates_rejected() {
        let err = WorkflowRegistry::builder()
            .register(definition("a"))
            .register(definition("a"))
            .build_result()
            .unwrap_err();
        assert!(err.contains("duplicate workflow registration: a"));
    }

    #[test]
    fn test_failed_definition_becomes_registration_error() {
        let broken = WorkflowDefinition::builder("broken").build();
        let err = WorkflowRegistry::builder()
            .register_result(broken)
            .register(definition("a"))
            .build_result()
            .unwrap_err();
        assert!(err.contains("workflow broken"));
    }

    #[test]
    fn test_merge() {
        let first = WorkflowRegistry::builder().register(definition("a")).build();
        let merged = WorkflowRegistry::builder()
            .merge(&first)
            .register(definition("b"))
            .build_result()
            .unwrap();
        assert_eq!(merged.len(), 2);
    }
}
