//! Tool and skill catalog.
//!
//! The catalog is static: it is loaded once (usually from a YAML file) and
//! handed to the pipeline behind the read-only [`ToolCatalog`] trait.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type ToolId = String;
pub type SkillId = String;

/// Declared potential for harmful side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "med" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// A named capability a caller must hold to invoke a tool (e.g. `fs.write`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(pub String);

impl Permission {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Permission {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// JSON value kinds used in parameter and return specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl ParamType {
    /// Whether `value` has this shape.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
            ParamType::Any => true,
        }
    }

    /// Coerce a loosely typed value (usually a string from user text or an LLM)
    /// into this type. Returns `None` when no sensible coercion exists.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        if self.accepts(value) {
            return Some(value.clone());
        }
        let s = value.as_str()?.trim();
        match self {
            ParamType::Integer => s.parse::<i64>().ok().map(Value::from),
            ParamType::Number => s.parse::<f64>().ok().and_then(|f| {
                serde_json::Number::from_f64(f).map(Value::Number)
            }),
            ParamType::Boolean => match s.to_lowercase().as_str() {
                "true" | "yes" | "1" | "是" => Some(Value::Bool(true)),
                "false" | "no" | "0" | "否" => Some(Value::Bool(false)),
                _ => None,
            },
            ParamType::Object | ParamType::Array => serde_json::from_str::<Value>(s)
                .ok()
                .filter(|v| self.accepts(v)),
            ParamType::String | ParamType::Any => None,
        }
    }
}

/// One declared tool parameter (a slot, from the pipeline's point of view).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Entity type used for deterministic inference from earlier turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    /// Slot-specific LLM prompt template. `{{slot}}`, `{{utterance}}` and
    /// `{{history}}` are substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Declared output shape of a tool.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReturnSpec {
    #[serde(rename = "type", default)]
    pub kind: ParamType,
    /// Fields an object result must carry. These are the tool's declared outputs.
    #[serde(default)]
    pub fields: Vec<String>,
}

impl ReturnSpec {
    /// Check a result against this spec. Returns the list of problems (empty = ok).
    pub fn mismatches(&self, value: &Value) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.kind.accepts(value) {
            problems.push(format!("expected {:?} result", self.kind));
            return problems;
        }
        if !self.fields.is_empty() {
            match value.as_object() {
                Some(obj) => {
                    for field in &self.fields {
                        if !obj.contains_key(field) {
                            problems.push(format!("missing field '{}'", field));
                        }
                    }
                }
                None => problems.push("expected object result with declared fields".to_string()),
            }
        }
        problems
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub returns: ReturnSpec,
}

/// Static description of an invocable tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: ToolId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schema: ToolSchema,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub required_permissions: BTreeSet<Permission>,
    #[serde(default)]
    pub examples: Vec<String>,
    /// Words that suggest this tool when they appear in a request.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Registered handler key. Defaults to the tool id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

impl ToolDefinition {
    pub fn handler_key(&self) -> &str {
        self.handler.as_deref().unwrap_or(&self.id)
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.schema.parameters.iter().find(|p| p.name == name)
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.schema.parameters.iter().filter(|p| p.required)
    }

    /// Keyword relevance of this tool for a piece of request text.
    /// An explicit mention of the id counts more than a keyword hit.
    pub fn relevance(&self, text: &str) -> u32 {
        let lower = text.to_lowercase();
        let mut score = 0;
        if lower.contains(&self.id.to_lowercase()) {
            score += 3;
        }
        for k in &self.keywords {
            if !k.is_empty() && (text.contains(k.as_str()) || lower.contains(&k.to_lowercase())) {
                score += 1;
            }
        }
        score
    }
}

/// A named bundle of related tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillDefinition {
    pub id: SkillId,
    #[serde(default)]
    pub description: String,
    pub tools: BTreeSet<ToolId>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl SkillDefinition {
    pub fn matches(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        lower.contains(&self.id.to_lowercase())
            || self
                .keywords
                .iter()
                .any(|k| !k.is_empty() && (text.contains(k.as_str()) || lower.contains(&k.to_lowercase())))
    }
}

/// Read-only catalog lookup used by the planner, scheduler and sandbox.
pub trait ToolCatalog: Send + Sync {
    fn get_tool(&self, id: &str) -> Option<&ToolDefinition>;

    fn list_by_skill(&self, skill_id: &str) -> Vec<ToolId>;

    fn tools(&self) -> Vec<&ToolDefinition>;

    fn skills(&self) -> Vec<&SkillDefinition>;

    /// Skills that contain `tool_id`.
    fn skills_for_tool(&self, tool_id: &str) -> Vec<&SkillDefinition> {
        self.skills()
            .into_iter()
            .filter(|s| s.tools.contains(tool_id))
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid catalog YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Duplicate tool id '{0}'")]
    DuplicateTool(String),

    #[error("Duplicate skill id '{0}'")]
    DuplicateSkill(String),

    #[error("Skill '{skill}' references unknown tool '{tool}'")]
    UnknownSkillTool { skill: String, tool: String },

    #[error("Tool '{tool}' declares parameter '{param}' more than once")]
    DuplicateParameter { tool: String, param: String },
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    tools: Vec<ToolDefinition>,
    #[serde(default)]
    skills: Vec<SkillDefinition>,
}

/// In-memory catalog, validated on construction.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    tools: BTreeMap<ToolId, ToolDefinition>,
    skills: BTreeMap<SkillId, SkillDefinition>,
}

impl StaticCatalog {
    pub fn new(
        tools: Vec<ToolDefinition>,
        skills: Vec<SkillDefinition>,
    ) -> Result<Self, CatalogError> {
        let mut tool_map = BTreeMap::new();
        for tool in tools {
            let mut seen = BTreeSet::new();
            for p in &tool.schema.parameters {
                if !seen.insert(p.name.as_str()) {
                    return Err(CatalogError::DuplicateParameter {
                        tool: tool.id.clone(),
                        param: p.name.clone(),
                    });
                }
            }
            if tool_map.contains_key(&tool.id) {
                return Err(CatalogError::DuplicateTool(tool.id));
            }
            tool_map.insert(tool.id.clone(), tool);
        }

        let mut skill_map = BTreeMap::new();
        for skill in skills {
            if let Some(missing) = skill.tools.iter().find(|t| !tool_map.contains_key(*t)) {
                return Err(CatalogError::UnknownSkillTool {
                    skill: skill.id.clone(),
                    tool: missing.clone(),
                });
            }
            if skill_map.contains_key(&skill.id) {
                return Err(CatalogError::DuplicateSkill(skill.id));
            }
            skill_map.insert(skill.id.clone(), skill);
        }

        Ok(Self {
            tools: tool_map,
            skills: skill_map,
        })
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_yaml::from_str(content)?;
        Self::new(file.tools, file.skills)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_yaml_str(&content)?;
        tracing::debug!(
            "Loaded catalog {}: {} tools, {} skills",
            path.display(),
            catalog.tools.len(),
            catalog.skills.len()
        );
        Ok(catalog)
    }
}

impl ToolCatalog for StaticCatalog {
    fn get_tool(&self, id: &str) -> Option<&ToolDefinition> {
        self.tools.get(id)
    }

    fn list_by_skill(&self, skill_id: &str) -> Vec<ToolId> {
        self.skills
            .get(skill_id)
            .map(|s| s.tools.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn tools(&self) -> Vec<&ToolDefinition> {
        self.tools.values().collect()
    }

    fn skills(&self) -> Vec<&SkillDefinition> {
        self.skills.values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CATALOG: &str = r#"
tools:
  - id: web_search
    description: Search the web
    keywords: [search, 搜索]
    schema:
      parameters:
        - { name: query, type: string, required: true }
      returns: { type: object, fields: [results] }
  - id: send_email
    risk_level: high
    required_permissions: [email.send]
    schema:
      parameters:
        - { name: to, type: string, required: true, entity: email }
        - { name: body, type: string, required: true }
skills:
  - id: research
    tools: [web_search]
    keywords: [调研]
"#;

    #[test]
    fn test_load_catalog_from_yaml() {
        let cat = StaticCatalog::from_yaml_str(CATALOG).unwrap();
        let email = cat.get_tool("send_email").unwrap();
        assert_eq!(email.risk_level, RiskLevel::High);
        assert!(email.required_permissions.contains(&Permission::from("email.send")));
        assert_eq!(email.handler_key(), "send_email");
        assert_eq!(cat.list_by_skill("research"), vec!["web_search".to_string()]);
        assert!(cat.list_by_skill("nope").is_empty());
        assert_eq!(cat.skills_for_tool("web_search").len(), 1);
    }

    #[test]
    fn test_skill_with_unknown_tool_is_rejected() {
        let yaml = "tools: []\nskills:\n  - { id: s, tools: [ghost] }\n";
        let err = StaticCatalog::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownSkillTool { .. }));
    }

    #[test]
    fn test_duplicate_tool_is_rejected() {
        let yaml = "tools:\n  - { id: a }\n  - { id: a }\n";
        assert!(matches!(
            StaticCatalog::from_yaml_str(yaml),
            Err(CatalogError::DuplicateTool(_))
        ));
    }

    #[test]
    fn test_return_spec_mismatches() {
        let spec = ReturnSpec {
            kind: ParamType::Object,
            fields: vec!["results".to_string()],
        };
        assert!(spec.mismatches(&json!({"results": []})).is_empty());
        assert_eq!(spec.mismatches(&json!({"other": 1})).len(), 1);
        assert_eq!(spec.mismatches(&json!("text")).len(), 1);
    }

    #[test]
    fn test_param_type_coerce() {
        assert_eq!(ParamType::Integer.coerce(&json!("42")), Some(json!(42)));
        assert_eq!(ParamType::Boolean.coerce(&json!("yes")), Some(json!(true)));
        assert_eq!(ParamType::Integer.coerce(&json!("abc")), None);
        assert_eq!(ParamType::String.coerce(&json!("x")), Some(json!("x")));
    }

    #[test]
    fn test_relevance_prefers_id_mention() {
        let cat = StaticCatalog::from_yaml_str(CATALOG).unwrap();
        let search = cat.get_tool("web_search").unwrap();
        assert_eq!(search.relevance("帮我搜索一下"), 1);
        assert_eq!(search.relevance("use web_search to search"), 4);
        assert_eq!(search.relevance("write a poem"), 0);
    }
}
