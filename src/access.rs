//! Access control for member file operations
//!
//! Read and write are evaluated independently; write never implies read.
//! For each mode:
//!
//! 1. reserved namespaces are denied unless the caller bypasses them
//! 2. a deny-list match denies, whatever the allow-list says
//! 3. a non-empty allow-list must match
//! 4. otherwise access is allowed
//!
//! Directory scope patterns cover the directory and everything beneath it,
//! whether written as `docs` or `docs/**`.

use std::fmt;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::team::Member;

/// File operation being checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => f.write_str("read"),
            AccessMode::Write => f.write_str("write"),
        }
    }
}

/// Protocol-reserved path classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservedScope {
    /// Encapsulated task-contract documents
    TaskContract,
    /// Internal runtime state of the dialog engine
    RuntimeState,
}

/// Which rule produced a denial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeniedScope {
    Reserved { scope: ReservedScope },
    DenyList { pattern: String },
    NotInAllowList,
    OutsideWorkspace,
}

/// Structured denial returned to the dialog that attempted the operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDenial {
    pub member_id: String,
    pub path: String,
    pub mode: AccessMode,
    pub scope: DeniedScope,
}

impl fmt::Display for AccessDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{} may not {} '{}': ", self.member_id, self.mode, self.path)?;
        match &self.scope {
            DeniedScope::Reserved { scope } => match scope {
                ReservedScope::TaskContract => f.write_str("task contract namespace is reserved"),
                ReservedScope::RuntimeState => f.write_str("runtime state namespace is reserved"),
            },
            DeniedScope::DenyList { pattern } => write!(f, "matches denied scope '{pattern}'"),
            DeniedScope::NotInAllowList => f.write_str("outside the allowed scopes"),
            DeniedScope::OutsideWorkspace => f.write_str("path escapes the workspace"),
        }
    }
}

/// Reserved namespace layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservedPaths {
    /// Directory-name suffix marking a task-contract package
    pub task_contract_suffix: String,
    /// Top-level directory holding runtime state
    pub runtime_state_dir: String,
}

impl Default for ReservedPaths {
    fn default() -> Self {
        Self {
            task_contract_suffix: ".tsk".to_string(),
            runtime_state_dir: ".dialogs".to_string(),
        }
    }
}

impl ReservedPaths {
    /// Classify a normalized workspace-relative path
    pub fn classify(&self, path: &str) -> Option<ReservedScope> {
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();

        if components.peek() == Some(&self.runtime_state_dir.as_str()) {
            return Some(ReservedScope::RuntimeState);
        }

        let suffix = self.task_contract_suffix.as_str();
        if !suffix.is_empty()
            && components.any(|c| c.len() > suffix.len() && c.ends_with(suffix))
        {
            return Some(ReservedScope::TaskContract);
        }

        None
    }
}

/// The four directory-scope lists of a member, as configured
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirScopes {
    #[serde(default)]
    pub read_dirs: Vec<String>,
    #[serde(default)]
    pub write_dirs: Vec<String>,
    #[serde(default)]
    pub no_read_dirs: Vec<String>,
    #[serde(default)]
    pub no_write_dirs: Vec<String>,
}

/// Compiled set of directory-scope patterns
#[derive(Debug, Clone)]
pub struct ScopeSet {
    patterns: Vec<String>,
    /// Index into `patterns` for each compiled glob
    owners: Vec<usize>,
    set: GlobSet,
}

impl ScopeSet {
    pub fn compile(patterns: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        let mut owners = Vec::new();

        for (idx, pattern) in patterns.iter().enumerate() {
            for glob in expand_pattern(pattern) {
                builder.add(GlobBuilder::new(&glob).literal_separator(true).build()?);
                owners.push(idx);
            }
        }

        Ok(Self {
            patterns: patterns.to_vec(),
            owners,
            set: builder.build()?,
        })
    }

    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            owners: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// First configured pattern covering `path`
    pub fn first_match(&self, path: &str) -> Option<&str> {
        self.set
            .matches(path)
            .into_iter()
            .map(|glob| self.owners[glob])
            .min()
            .map(|idx| self.patterns[idx].as_str())
    }
}

/// Compiled directory scopes of one member
#[derive(Debug, Clone)]
pub struct MemberScopes {
    pub read: ScopeSet,
    pub write: ScopeSet,
    pub no_read: ScopeSet,
    pub no_write: ScopeSet,
}

impl MemberScopes {
    pub fn compile(dirs: &DirScopes) -> Result<Self, globset::Error> {
        Ok(Self {
            read: ScopeSet::compile(&dirs.read_dirs)?,
            write: ScopeSet::compile(&dirs.write_dirs)?,
            no_read: ScopeSet::compile(&dirs.no_read_dirs)?,
            no_write: ScopeSet::compile(&dirs.no_write_dirs)?,
        })
    }

    /// No lists at all: everything outside reserved namespaces is allowed
    pub fn open() -> Self {
        Self {
            read: ScopeSet::empty(),
            write: ScopeSet::empty(),
            no_read: ScopeSet::empty(),
            no_write: ScopeSet::empty(),
        }
    }

    fn lists(&self, mode: AccessMode) -> (&ScopeSet, &ScopeSet) {
        match mode {
            AccessMode::Read => (&self.read, &self.no_read),
            AccessMode::Write => (&self.write, &self.no_write),
        }
    }
}

/// Scope pattern → globs covering the directory itself and its descendants
fn expand_pattern(pattern: &str) -> Vec<String> {
    let normalized = pattern.trim().replace('\\', "/");
    let trimmed = normalized
        .trim_start_matches("./")
        .trim_end_matches('/');

    if trimmed.is_empty() || trimmed == "." || trimmed == "**" {
        return vec!["**".to_string()];
    }

    match trimmed.strip_suffix("/**") {
        Some(base) => vec![base.to_string(), trimmed.to_string()],
        None => vec![trimmed.to_string(), format!("{trimmed}/**")],
    }
}

/// Lexically normalize a workspace-relative path; `None` if it leaves the workspace
pub fn normalize_path(path: &str) -> Option<String> {
    let path = path.trim().replace('\\', "/");
    if path.starts_with('/') {
        return None;
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }

    Some(parts.join("/"))
}

/// Stateless evaluator shared by every dialog
#[derive(Debug, Clone, Default)]
pub struct AccessEvaluator {
    reserved: ReservedPaths,
}

impl AccessEvaluator {
    pub fn new(reserved: ReservedPaths) -> Self {
        Self { reserved }
    }

    pub fn reserved(&self) -> &ReservedPaths {
        &self.reserved
    }

    pub fn may_read(&self, member: &Member, path: &str) -> bool {
        self.check(member, path, AccessMode::Read, false).is_ok()
    }

    pub fn may_write(&self, member: &Member, path: &str) -> bool {
        self.check(member, path, AccessMode::Write, false).is_ok()
    }

    /// Full check; `bypass_reserved` is only granted to privileged capabilities
    pub fn check(
        &self,
        member: &Member,
        path: &str,
        mode: AccessMode,
        bypass_reserved: bool,
    ) -> Result<(), AccessDenial> {
        let deny = |scope: DeniedScope| {
            debug!(member = %member.id, path, %mode, ?scope, "Access denied");
            AccessDenial {
                member_id: member.id.clone(),
                path: path.to_string(),
                mode,
                scope,
            }
        };

        let normalized = normalize_path(path).ok_or_else(|| deny(DeniedScope::OutsideWorkspace))?;

        if !bypass_reserved {
            if let Some(scope) = self.reserved.classify(&normalized) {
                return Err(deny(DeniedScope::Reserved { scope }));
            }
        }

        let (allow, forbid) = member.scopes.lists(mode);

        if let Some(pattern) = forbid.first_match(&normalized) {
            return Err(deny(DeniedScope::DenyList {
                pattern: pattern.to_string(),
            }));
        }

        if !allow.is_empty() && allow.first_match(&normalized).is_none() {
            return Err(deny(DeniedScope::NotInAllowList));
        }

        Ok(())
    }
}
