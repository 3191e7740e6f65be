use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::types::{Task, TaskResult};

/// Opaque handler for one capability (`agent_type`).
///
/// `process_task` is allowed to block for an arbitrary amount of time; the
/// engine enforces timeouts externally (spec.md S4.2). Implementations must
/// be reentrant: the engine may invoke the same agent concurrently for
/// different nodes.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn process_task(&self, task: Task) -> TaskResult;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no suitable agent registered for capability '{0}'")]
    NoSuitableAgent(String),
    #[error("capability '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// In-memory mapping from capability key (`agent_type`) to an [`Agent`].
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Register a handler for a capability key. Fails if one is already
    /// registered rather than silently overwriting it.
    pub fn register(
        &mut self,
        capability: impl Into<String>,
        agent: Arc<dyn Agent>,
    ) -> Result<(), RegistryError> {
        let capability = capability.into();
        if self.agents.contains_key(&capability) {
            return Err(RegistryError::AlreadyRegistered(capability));
        }
        self.agents.insert(capability, agent);
        Ok(())
    }

    /// Replace (or insert) a handler for a capability key unconditionally.
    pub fn register_or_replace(&mut self, capability: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.insert(capability.into(), agent);
    }

    pub fn lookup(&self, capability: &str) -> Result<Arc<dyn Agent>, RegistryError> {
        self.agents
            .get(capability)
            .cloned()
            .ok_or_else(|| RegistryError::NoSuitableAgent(capability.to_string()))
    }

    pub fn capabilities(&self) -> Vec<&str> {
        self.agents.keys().map(|s| s.as_str()).collect()
    }
}
