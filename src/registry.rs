//! Tool registry: named handlers with JSON Schema, safe under parallel
//! callers, with configurable exported-name remapping.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{Error, Result};

/// Async tool handler: JSON params in, JSON result out.
pub type ToolHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

#[derive(Clone)]
pub struct ToolDefinition {
    pub internal_name: String,
    /// Name shown to clients; defaults to the internal name.
    pub exported_name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub handler: ToolHandler,
}

impl ToolDefinition {
    pub fn new(
        internal_name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
        handler: ToolHandler,
    ) -> Self {
        let internal_name = internal_name.into();
        Self {
            exported_name: internal_name.clone(),
            internal_name,
            description: description.into(),
            input_schema,
            handler,
        }
    }

    pub fn exported_as(mut self, name: impl Into<String>) -> Self {
        self.exported_name = name.into();
        self
    }
}

#[derive(Default)]
struct Inner {
    tools: HashMap<String, ToolDefinition>,
    /// exported name -> internal name
    exported: HashMap<String, String>,
}

#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<Inner>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, def: ToolDefinition) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.tools.contains_key(&def.internal_name) {
            return Err(Error::AlreadyExists(def.internal_name));
        }
        if def.exported_name != def.internal_name {
            inner.exported.insert(def.exported_name.clone(), def.internal_name.clone());
        }
        inner.tools.insert(def.internal_name.clone(), def);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let internal = inner.exported.get(name).cloned().unwrap_or_else(|| name.to_string());
        let removed = inner
            .tools
            .remove(&internal)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        inner.exported.remove(&removed.exported_name);
        Ok(())
    }

    pub fn has(&self, name: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner.tools.contains_key(name) || inner.exported.contains_key(name)
    }

    /// Registered tools sorted by exported name.
    pub fn list(&self) -> Vec<ToolDefinition> {
        let inner = self.inner.read().unwrap();
        let mut tools: Vec<ToolDefinition> = inner.tools.values().cloned().collect();
        tools.sort_by(|a, b| a.exported_name.cmp(&b.exported_name));
        tools
    }

    pub fn get(&self, name: &str) -> Option<ToolDefinition> {
        let inner = self.inner.read().unwrap();
        let internal = inner.exported.get(name).map(|s| s.as_str()).unwrap_or(name);
        inner.tools.get(internal).cloned()
    }

    /// Invoke a tool by internal or exported name with a deadline.
    ///
    /// Handler panics are contained and reported as internal errors; a missed
    /// deadline reports `timeout`.
    pub async fn execute(
        &self,
        name: &str,
        params: serde_json::Value,
        deadline: Duration,
    ) -> Result<serde_json::Value> {
        let def = self.get(name).ok_or_else(|| Error::NotFound(name.to_string()))?;
        let handler = def.handler.clone();

        // Spawn so a panicking handler unwinds into the join error instead of
        // tearing down the caller.
        let task = tokio::spawn(async move { handler(params).await });
        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                tracing::error!(tool = name, "tool handler panicked");
                Err(Error::Internal(format!("tool '{name}' panicked")))
            }
            Ok(Err(_)) => Err(Error::Canceled),
            Err(_) => Err(Error::Timeout(format!("tool '{name}' exceeded {deadline:?}"))),
        }
    }
}
