//! Member registry
//!
//! A roster is loaded once into an immutable [`Team`]. Each member entry is
//! merged over `member_defaults`, validated and resolved on its own; an entry
//! that fails is left out and reported, and the rest of the team still loads.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::access::{DirScopes, MemberScopes};
use crate::error::{ConfigValidationError, TeamError};
use crate::tellask::{is_reserved_target, is_valid_name};
use crate::tools::ToolCatalog;

/// Token selecting every toolset (or every tool)
pub const WILDCARD: &str = "*";
/// Prefix excluding a toolset or tool
pub const EXCLUDE_PREFIX: char = '!';

/// Model/provider a member generates with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelBinding {
    pub provider: String,
    pub model: String,
}

impl ModelBinding {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Fully resolved, immutable member profile
#[derive(Debug, Clone)]
pub struct Member {
    pub id: String,
    pub name: String,
    pub hidden: bool,
    pub binding: ModelBinding,
    /// Tool names, deduplicated, in declaration order
    pub capabilities: Vec<String>,
    pub dirs: DirScopes,
    pub scopes: MemberScopes,
}

impl Member {
    /// A listed member with no capabilities and no directory lists
    pub fn new(id: impl Into<String>, binding: ModelBinding) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            hidden: false,
            binding,
            capabilities: Vec::new(),
            dirs: DirScopes::default(),
            scopes: MemberScopes::open(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn with_capabilities<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scopes(mut self, scopes: MemberScopes) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn has_capability(&self, tool: &str) -> bool {
        self.capabilities.iter().any(|t| t == tool)
    }
}

/// Member fields as written in the roster; unset fields inherit defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemberSpec {
    pub name: Option<String>,
    pub hidden: Option<bool>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub toolsets: Option<Vec<String>>,
    pub tools: Option<Vec<String>>,
    pub read_dirs: Option<Vec<String>>,
    pub write_dirs: Option<Vec<String>>,
    pub no_read_dirs: Option<Vec<String>>,
    pub no_write_dirs: Option<Vec<String>>,
}

impl MemberSpec {
    /// Fill every unset field from `defaults`
    pub fn merged_over(self, defaults: &MemberSpec) -> MemberSpec {
        MemberSpec {
            name: self.name.or_else(|| defaults.name.clone()),
            hidden: self.hidden.or(defaults.hidden),
            provider: self.provider.or_else(|| defaults.provider.clone()),
            model: self.model.or_else(|| defaults.model.clone()),
            toolsets: self.toolsets.or_else(|| defaults.toolsets.clone()),
            tools: self.tools.or_else(|| defaults.tools.clone()),
            read_dirs: self.read_dirs.or_else(|| defaults.read_dirs.clone()),
            write_dirs: self.write_dirs.or_else(|| defaults.write_dirs.clone()),
            no_read_dirs: self.no_read_dirs.or_else(|| defaults.no_read_dirs.clone()),
            no_write_dirs: self.no_write_dirs.or_else(|| defaults.no_write_dirs.clone()),
        }
    }

    fn dir_scopes(&self) -> DirScopes {
        DirScopes {
            read_dirs: self.read_dirs.clone().unwrap_or_default(),
            write_dirs: self.write_dirs.clone().unwrap_or_default(),
            no_read_dirs: self.no_read_dirs.clone().unwrap_or_default(),
            no_write_dirs: self.no_write_dirs.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RosterFile {
    #[serde(default)]
    member_defaults: MemberSpec,
    #[serde(default)]
    members: serde_yaml::Mapping,
}

/// A loaded team plus everything reported while loading it
#[derive(Debug)]
pub struct TeamLoad {
    pub team: Team,
    /// Members left out of the team
    pub errors: Vec<ConfigValidationError>,
    /// Non-fatal notes, e.g. dropped duplicate tools
    pub diagnostics: Vec<String>,
}

/// Immutable roster snapshot, shared freely across dialogs
#[derive(Debug, Clone, Default)]
pub struct Team {
    members: Vec<Member>,
    index: HashMap<String, usize>,
}

impl Team {
    /// Build from resolved members; a repeated id keeps the first entry
    pub fn new(members: Vec<Member>) -> Self {
        let mut team = Team::default();
        for member in members {
            if team.index.contains_key(&member.id) {
                warn!(member = %member.id, "Duplicate member id ignored");
                continue;
            }
            team.index.insert(member.id.clone(), team.members.len());
            team.members.push(member);
        }
        team
    }

    pub fn get(&self, id: &str) -> Option<&Member> {
        self.index.get(id).map(|&idx| &self.members[idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// All members in roster order, hidden ones included
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Members shown in team listings
    pub fn listed(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| !m.hidden)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Load a roster file
    pub fn load(path: impl AsRef<Path>, catalog: &ToolCatalog) -> Result<TeamLoad, TeamError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content, catalog)
    }

    /// Parse and resolve a roster
    pub fn from_yaml_str(yaml: &str, catalog: &ToolCatalog) -> Result<TeamLoad, TeamError> {
        let roster: RosterFile = serde_yaml::from_str(yaml)?;

        let mut members = Vec::new();
        let mut errors = Vec::new();
        let mut diagnostics = Vec::new();

        for (key, value) in roster.members {
            let member_id = match key.as_str() {
                Some(id) => id.to_string(),
                None => {
                    errors.push(ConfigValidationError {
                        member_id: format!("{key:?}"),
                        message: "member id must be a string".to_string(),
                    });
                    continue;
                }
            };

            match resolve_member(&member_id, value, &roster.member_defaults, catalog) {
                Ok((member, notes)) => {
                    diagnostics.extend(notes);
                    members.push(member);
                }
                Err(err) => {
                    warn!(member = %err.member_id, error = %err.message, "Member left out of team");
                    errors.push(err);
                }
            }
        }

        if members.is_empty() {
            return Err(TeamError::NoUsableMembers(errors));
        }

        for note in &diagnostics {
            warn!(diagnostic = %note, "Roster diagnostic");
        }
        info!(
            members = members.len(),
            invalid = errors.len(),
            "Team loaded"
        );

        Ok(TeamLoad {
            team: Team::new(members),
            errors,
            diagnostics,
        })
    }
}

fn resolve_member(
    member_id: &str,
    value: serde_yaml::Value,
    defaults: &MemberSpec,
    catalog: &ToolCatalog,
) -> Result<(Member, Vec<String>), ConfigValidationError> {
    let invalid = |message: String| ConfigValidationError {
        member_id: member_id.to_string(),
        message,
    };

    if !is_valid_name(member_id) {
        return Err(invalid("id is not a valid name token".to_string()));
    }
    if is_reserved_target(member_id) {
        return Err(invalid("id is reserved by the call protocol".to_string()));
    }

    let spec: MemberSpec = if value.is_null() {
        MemberSpec::default()
    } else {
        serde_yaml::from_value(value).map_err(|e| invalid(e.to_string()))?
    };
    let spec = spec.merged_over(defaults);

    let provider = non_empty(spec.provider.as_deref())
        .ok_or_else(|| invalid("no provider configured".to_string()))?;
    let model = non_empty(spec.model.as_deref())
        .ok_or_else(|| invalid("no model configured".to_string()))?;

    let dirs = spec.dir_scopes();
    let scopes = MemberScopes::compile(&dirs).map_err(|e| invalid(format!("invalid directory scope: {e}")))?;

    let (capabilities, notes) = resolve_capabilities(
        member_id,
        spec.toolsets.as_deref().unwrap_or_default(),
        spec.tools.as_deref().unwrap_or_default(),
        catalog,
    );

    let member = Member {
        id: member_id.to_string(),
        name: spec.name.clone().unwrap_or_else(|| member_id.to_string()),
        hidden: spec.hidden.unwrap_or(false),
        binding: ModelBinding::new(provider, model),
        capabilities,
        dirs,
        scopes,
    };

    Ok((member, notes))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Resolve `toolsets`/`tools` declarations into a flat capability list
///
/// First occurrence of a tool name wins; later duplicates are dropped with a
/// diagnostic. Exclusions apply wherever they appear in the list.
pub fn resolve_capabilities(
    member_id: &str,
    toolsets: &[String],
    tools: &[String],
    catalog: &ToolCatalog,
) -> (Vec<String>, Vec<String>) {
    let mut notes = Vec::new();

    let excluded_sets: Vec<&str> = toolsets
        .iter()
        .filter_map(|t| t.strip_prefix(EXCLUDE_PREFIX))
        .collect();
    let excluded_tools: Vec<&str> = tools
        .iter()
        .filter_map(|t| t.strip_prefix(EXCLUDE_PREFIX))
        .collect();

    let mut selected_sets: Vec<&str> = Vec::new();
    for entry in toolsets {
        if entry.starts_with(EXCLUDE_PREFIX) {
            continue;
        }
        let names: Vec<&str> = if entry == WILDCARD {
            catalog.toolset_names().collect()
        } else if catalog.toolset(entry).is_some() {
            vec![entry.as_str()]
        } else {
            notes.push(format!("@{member_id}: unknown toolset '{entry}' ignored"));
            continue;
        };
        for name in names {
            if !excluded_sets.contains(&name) && !selected_sets.contains(&name) {
                selected_sets.push(name);
            }
        }
    }

    // (tool, where it was declared)
    let mut declared: Vec<(String, String)> = Vec::new();
    for set in &selected_sets {
        for tool in catalog.toolset(set).unwrap_or_default() {
            declared.push((tool.clone(), format!("toolset '{set}'")));
        }
    }
    for entry in tools {
        if entry.starts_with(EXCLUDE_PREFIX) {
            continue;
        }
        if entry == WILDCARD {
            for tool in catalog.all_tools() {
                declared.push((tool, "tools '*'".to_string()));
            }
        } else if catalog.has_tool(entry) {
            declared.push((entry.clone(), "tools".to_string()));
        } else {
            notes.push(format!("@{member_id}: unknown tool '{entry}' ignored"));
        }
    }

    let mut capabilities: Vec<String> = Vec::new();
    let mut origins: HashMap<String, String> = HashMap::new();
    for (tool, origin) in declared {
        if excluded_tools.contains(&tool.as_str()) {
            continue;
        }
        if let Some(first) = origins.get(&tool) {
            notes.push(format!(
                "@{member_id}: duplicate tool '{tool}' from {origin} dropped, keeping {first}"
            ));
            continue;
        }
        origins.insert(tool.clone(), origin);
        capabilities.push(tool);
    }

    (capabilities, notes)
}
