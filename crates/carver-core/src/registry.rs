use std::collections::HashMap;

use carver_types::error::{CarveError, Result};

/// Endpoint lookups consumed from the enrollment layer.
pub trait NodeRegistry: Send + Sync {
    /// Environment the endpoint is enrolled in, or `None` if it is unknown.
    fn environment_of(&self, node_uuid: &str) -> Result<Option<String>>;

    /// Fail unless `node_uuid` is enrolled in `environment`.
    fn verify_environment(&self, node_uuid: &str, environment: &str) -> Result<()> {
        match self.environment_of(node_uuid)? {
            Some(env) if env == environment => Ok(()),
            Some(_) => Err(CarveError::EnvironmentMismatch {
                node: node_uuid.to_string(),
                environment: environment.to_string(),
            }),
            None => Err(CarveError::NotFound(format!("node '{node_uuid}'"))),
        }
    }
}

/// Registry loaded once from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    nodes: HashMap<String, String>,
}

impl StaticRegistry {
    pub fn new(nodes: HashMap<String, String>) -> Self {
        Self { nodes }
    }

    pub fn insert(&mut self, node_uuid: impl Into<String>, environment: impl Into<String>) {
        self.nodes.insert(node_uuid.into(), environment.into());
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeRegistry for StaticRegistry {
    fn environment_of(&self, node_uuid: &str) -> Result<Option<String>> {
        Ok(self.nodes.get(node_uuid).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> StaticRegistry {
        let mut registry = StaticRegistry::default();
        registry.insert("node-a", "prod");
        registry
    }

    #[test]
    fn verify_accepts_enrolled_environment() {
        registry().verify_environment("node-a", "prod").unwrap();
    }

    #[test]
    fn verify_rejects_other_environment() {
        let err = registry().verify_environment("node-a", "dev").unwrap_err();
        assert!(matches!(err, CarveError::EnvironmentMismatch { .. }), "{err}");
    }

    #[test]
    fn counts_enrolled_nodes() {
        let mut registry = StaticRegistry::default();
        assert!(registry.is_empty());
        registry.insert("node-a", "prod");
        registry.insert("node-a", "dev");
        registry.insert("node-b", "prod");
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_empty());
    }

    #[test]
    fn verify_rejects_unknown_node() {
        let err = registry().verify_environment("node-z", "prod").unwrap_err();
        assert!(matches!(err, CarveError::NotFound(_)), "{err}");
    }
}
