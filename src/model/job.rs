//! Job definition handed to the updater.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Loosely typed JSON object, used where the job format carries free-form maps.
pub type Object = serde_json::Map<String, Value>;

/// Experiment flags keyed by name.
pub type Experiments = BTreeMap<String, Value>;

/// Credential fields that never leave the proxy.
pub const SECRET_FIELDS: [&str; 5] = ["username", "token", "password", "key", "auth-key"];

/// Experiment that moves the repository checkout onto case-insensitive storage.
pub const CASE_INSENSITIVE_EXPERIMENT: &str = "use_case_insensitive_filesystem";

/// Experiment that enables the dependency-graph command in the updater.
pub const DEPENDENCY_GRAPH_EXPERIMENT: &str = "enable_dependency_submission_poc";

/// Which phase the updater runs after fetching files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCommand {
    Update,
    Graph,
}

impl JobCommand {
    /// The `bin/run` phase that follows `fetch_files`.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Update => "update_files",
            Self::Graph => "update_graph",
        }
    }
}

/// The update task definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Job {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<JobCommand>,
    pub package_manager: String,
    pub allowed_updates: Vec<Allowed>,
    pub dependency_groups: Vec<Group>,
    pub dependencies: Option<Vec<String>>,
    pub existing_pull_requests: Vec<Vec<ExistingPr>>,
    pub experiments: Experiments,
    pub ignore_conditions: Vec<Condition>,
    pub lockfile_only: bool,
    pub requirements_update_strategy: Option<String>,
    pub security_advisories: Vec<Advisory>,
    pub security_updates_only: bool,
    pub source: Source,
    pub update_subdependencies: bool,
    pub updating_a_pull_request: bool,
    pub vendor_dependencies: bool,
    pub reject_external_code: bool,
    pub commit_message_options: Option<CommitOptions>,
    pub credentials_metadata: Vec<Credential>,
    pub max_updater_run_time: u64,
}

impl Job {
    /// Whether an experiment flag is switched on.
    ///
    /// Accepts a JSON boolean or the string `"true"`.
    pub fn experiment_enabled(&self, name: &str) -> bool {
        match self.experiments.get(name) {
            Some(Value::Bool(enabled)) => *enabled,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn use_case_insensitive_filesystem(&self) -> bool {
        self.experiment_enabled(CASE_INSENSITIVE_EXPERIMENT)
    }

    /// The command the updater should run, defaulting to a normal update.
    pub fn command(&self) -> JobCommand {
        self.command.unwrap_or(JobCommand::Update)
    }

    /// Serialize the job the way it is stored in scenario files.
    ///
    /// The updater needs every collection present, but fixtures stay small by
    /// dropping null, false, zero and empty values.
    pub fn fixture_value(&self) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.retain(|key, v| key == "package-manager" || key == "source" || !is_blank(v));
            if let Some(Value::Object(source)) = map.get_mut("source") {
                source.retain(|_, v| !is_blank(v));
            }
        }
        Ok(value)
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// Repository the job operates on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Source {
    pub provider: String,
    pub repo: String,
    pub directory: String,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub hostname: Option<String>,
    pub api_endpoint: Option<String>,
}

impl Source {
    /// The pinned commit, ignoring an empty string.
    pub fn commit(&self) -> Option<&str> {
        self.commit.as_deref().filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Allowed {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dependency_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dependency_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub update_type: String,
}

impl Allowed {
    /// Allow every update.
    pub fn all() -> Self {
        Self {
            update_type: "all".to_string(),
            ..Default::default()
        }
    }

    /// Allow updates to a single named dependency.
    pub fn dependency(name: impl Into<String>) -> Self {
        Self {
            dependency_name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Object::is_empty")]
    pub rules: Object,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExistingPr {
    pub dependency_name: String,
    pub dependency_version: String,
}

/// An ignore rule for the updater.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Condition {
    pub dependency_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub update_types: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version_requirement: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Advisory {
    pub dependency_name: String,
    pub affected_versions: Vec<String>,
    pub patched_versions: Vec<String>,
    pub unaffected_versions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CommitOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prefix_development: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_scope: Option<String>,
}

/// One secret as an open string-keyed map (`type`, `host`, `password`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(BTreeMap<String, Value>);

impl Credential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field (builder style).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// A field's value if it is a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// The credential's `type` field.
    pub fn kind(&self) -> Option<&str> {
        self.get_str("type")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> {
        self.0.values_mut()
    }

    /// Copy of this credential with every secret field removed.
    pub fn metadata(&self) -> Credential {
        Credential(
            self.0
                .iter()
                .filter(|(k, _)| !SECRET_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}
