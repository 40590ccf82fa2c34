//! Tool collaborators and the catalog members resolve capabilities against

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::{AccessDenial, AccessMode};
use crate::types::{DialogId, DialogStatus};

/// One path an invocation will touch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathAccess {
    pub path: String,
    pub mode: AccessMode,
}

impl PathAccess {
    pub fn read(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: AccessMode::Read,
        }
    }

    pub fn write(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: AccessMode::Write,
        }
    }
}

/// Who is invoking a tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolContext {
    pub dialog_id: DialogId,
    pub member_id: String,
}

/// A side-effecting capability offered to dialogs
///
/// Timeouts and retries are the tool's own business; the orchestrator only
/// sees the final text or error.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Paths `args` will touch; each is checked before `invoke` runs
    fn footprint(&self, _args: &serde_json::Value) -> Vec<PathAccess> {
        Vec::new()
    }

    /// Privileged tools may reach reserved namespaces
    fn bypasses_reserved(&self) -> bool {
        false
    }

    async fn invoke(&self, ctx: &ToolContext, args: serde_json::Value) -> anyhow::Result<String>;
}

/// Outcome of a guarded tool invocation that did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ToolError {
    #[error("{0}")]
    Denied(AccessDenial),

    #[error("Dialog not found: {dialog}")]
    UnknownDialog { dialog: DialogId },

    #[error("Dialog {dialog} is toolless")]
    Toolless { dialog: DialogId },

    #[error("Dialog {dialog} is {status}, tools run only in active dialogs")]
    NotActive { dialog: DialogId, status: DialogStatus },

    #[error("@{member} has no capability '{tool}'")]
    NotPermitted { member: String, tool: String },

    #[error("Unknown tool: {tool}")]
    UnknownTool { tool: String },

    #[error("Tool failed: {message}")]
    Failed { message: String },
}

/// Ordered toolset definitions plus tools registered on their own
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    toolsets: Vec<(String, Vec<String>)>,
    loose: Vec<String>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_toolset<I, S>(mut self, name: impl Into<String>, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_toolset(name, tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>) -> Self {
        self.loose.push(name.into());
        self
    }

    fn add_toolset(&mut self, name: impl Into<String>, tools: Vec<String>) {
        let name = name.into();
        match self.toolsets.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => existing.extend(tools),
            None => self.toolsets.push((name, tools)),
        }
    }

    pub fn toolset(&self, name: &str) -> Option<&[String]> {
        self.toolsets
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, tools)| tools.as_slice())
    }

    pub fn toolset_names(&self) -> impl Iterator<Item = &str> {
        self.toolsets.iter().map(|(n, _)| n.as_str())
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.loose.iter().any(|t| t == name)
            || self.toolsets.iter().any(|(_, tools)| tools.iter().any(|t| t == name))
    }

    /// Every tool, toolsets first in declaration order, deduplicated
    pub fn all_tools(&self) -> Vec<String> {
        let mut all: Vec<String> = Vec::new();
        let toolset_tools = self.toolsets.iter().flat_map(|(_, tools)| tools.iter());
        for tool in toolset_tools.chain(self.loose.iter()) {
            if !all.contains(tool) {
                all.push(tool.clone());
            }
        }
        all
    }
}

/// Registered tool implementations
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    catalog: ToolCatalog,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool outside any toolset
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if !self.catalog.has_tool(&name) {
            self.catalog.loose.push(name.clone());
        }
        self.tools.insert(name, tool);
    }

    /// Register tools under a named toolset
    pub fn register_toolset(&mut self, toolset: impl Into<String>, tools: Vec<Arc<dyn Tool>>) {
        let names = tools.iter().map(|t| t.name().to_string()).collect();
        self.catalog.add_toolset(toolset, names);
        for tool in tools {
            self.tools.insert(tool.name().to_string(), tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
