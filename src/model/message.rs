//! Typed messages the updater sends to the control plane.
//!
//! Each request path names a [`MessageKind`]; its body is `{"data": ...}`
//! with a kind-specific payload. Payloads are decoded strictly, so an unknown
//! field is a decode error rather than silently dropped.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::job::Object;

fn is_false(b: &bool) -> bool {
    !*b
}

/// The closed set of control-plane endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    UpdateDependencyList,
    CreatePullRequest,
    UpdatePullRequest,
    ClosePullRequest,
    MarkAsProcessed,
    RecordEcosystemVersions,
    RecordUpdateJobError,
    IncrementMetric,
}

impl MessageKind {
    pub const ALL: [MessageKind; 8] = [
        Self::UpdateDependencyList,
        Self::CreatePullRequest,
        Self::UpdatePullRequest,
        Self::ClosePullRequest,
        Self::MarkAsProcessed,
        Self::RecordEcosystemVersions,
        Self::RecordUpdateJobError,
        Self::IncrementMetric,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateDependencyList => "update_dependency_list",
            Self::CreatePullRequest => "create_pull_request",
            Self::UpdatePullRequest => "update_pull_request",
            Self::ClosePullRequest => "close_pull_request",
            Self::MarkAsProcessed => "mark_as_processed",
            Self::RecordEcosystemVersions => "record_ecosystem_versions",
            Self::RecordUpdateJobError => "record_update_job_error",
            Self::IncrementMetric => "increment_metric",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unexpected output type: {s}"))
    }
}

/// The `{"data": ...}` wrapper around every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope<T> {
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Dependency {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_requirements: Option<Vec<Requirement>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub previous_version: String,
    pub requirements: Vec<Requirement>,
    pub version: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub removed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Requirement {
    pub file: String,
    pub groups: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Object>,
    pub requirement: Option<String>,
    pub source: Option<Object>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub previous_version: String,
}

/// A file the updater changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DependencyFile {
    pub content: String,
    pub content_encoding: String,
    pub deleted: bool,
    pub directory: String,
    pub name: String,
    pub operation: String,
    pub support_file: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub symlink_target: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mode: String,
}

impl DependencyFile {
    /// Replace base64 content with the hex SHA-256 of the encoded text.
    ///
    /// Idempotent: once hashed, the encoding is `sha256` and the file is left alone.
    pub fn hash_binary_content(&mut self) {
        if self.content_encoding == "base64" {
            self.content_encoding = "sha256".to_string();
            self.content = hex::encode(Sha256::digest(self.content.as_bytes()));
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpdateDependencyList {
    pub dependencies: Vec<Dependency>,
    pub dependency_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct CreatePullRequest {
    pub base_commit_sha: String,
    pub dependencies: Vec<Dependency>,
    pub updated_dependency_files: Vec<DependencyFile>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pr_title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pr_body: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub commit_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency_group: Option<Object>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct UpdatePullRequest {
    pub base_commit_sha: String,
    pub dependency_names: Vec<String>,
    pub updated_dependency_files: Vec<DependencyFile>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pr_title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pr_body: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub commit_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency_group: Option<Object>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct ClosePullRequest {
    pub dependency_names: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct MarkAsProcessed {
    pub base_commit_sha: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordEcosystemVersions {
    pub ecosystem_versions: Option<Object>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct RecordUpdateJobError {
    pub error_type: String,
    pub error_details: Option<Object>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IncrementMetric {
    pub metric: String,
    pub tags: Option<Object>,
}

/// One decoded control-plane call.
///
/// Serializes as `{type: <kind>, expect: {data: <payload>}}`, the layout of a
/// scenario file's output entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "expect", rename_all = "snake_case")]
pub enum Message {
    UpdateDependencyList(Envelope<UpdateDependencyList>),
    CreatePullRequest(Envelope<CreatePullRequest>),
    UpdatePullRequest(Envelope<UpdatePullRequest>),
    ClosePullRequest(Envelope<ClosePullRequest>),
    MarkAsProcessed(Envelope<MarkAsProcessed>),
    RecordEcosystemVersions(Envelope<RecordEcosystemVersions>),
    RecordUpdateJobError(Envelope<RecordUpdateJobError>),
    IncrementMetric(Envelope<IncrementMetric>),
}

fn strict<T: DeserializeOwned>(body: &[u8]) -> Result<Envelope<T>, serde_json::Error> {
    serde_json::from_slice(body)
}

impl Message {
    /// Decode a request body for the given kind.
    pub fn decode(kind: MessageKind, body: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageKind::UpdateDependencyList => Self::UpdateDependencyList(strict(body)?),
            MessageKind::CreatePullRequest => Self::CreatePullRequest(strict(body)?),
            MessageKind::UpdatePullRequest => Self::UpdatePullRequest(strict(body)?),
            MessageKind::ClosePullRequest => Self::ClosePullRequest(strict(body)?),
            MessageKind::MarkAsProcessed => Self::MarkAsProcessed(strict(body)?),
            MessageKind::RecordEcosystemVersions => Self::RecordEcosystemVersions(strict(body)?),
            MessageKind::RecordUpdateJobError => Self::RecordUpdateJobError(strict(body)?),
            MessageKind::IncrementMetric => Self::IncrementMetric(strict(body)?),
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::UpdateDependencyList(_) => MessageKind::UpdateDependencyList,
            Self::CreatePullRequest(_) => MessageKind::CreatePullRequest,
            Self::UpdatePullRequest(_) => MessageKind::UpdatePullRequest,
            Self::ClosePullRequest(_) => MessageKind::ClosePullRequest,
            Self::MarkAsProcessed(_) => MessageKind::MarkAsProcessed,
            Self::RecordEcosystemVersions(_) => MessageKind::RecordEcosystemVersions,
            Self::RecordUpdateJobError(_) => MessageKind::RecordUpdateJobError,
            Self::IncrementMetric(_) => MessageKind::IncrementMetric,
        }
    }

    /// Copy with base64 file content in pull-request payloads replaced by its hash.
    pub fn with_hashed_files(&self) -> Self {
        let mut message = self.clone();
        let files = match &mut message {
            Self::CreatePullRequest(e) => Some(&mut e.data.updated_dependency_files),
            Self::UpdatePullRequest(e) => Some(&mut e.data.updated_dependency_files),
            _ => None,
        };
        if let Some(files) = files {
            files.iter_mut().for_each(DependencyFile::hash_binary_content);
        }
        message
    }

    /// The payload as JSON, without the envelope.
    pub fn data_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::UpdateDependencyList(e) => serde_json::to_value(&e.data),
            Self::CreatePullRequest(e) => serde_json::to_value(&e.data),
            Self::UpdatePullRequest(e) => serde_json::to_value(&e.data),
            Self::ClosePullRequest(e) => serde_json::to_value(&e.data),
            Self::MarkAsProcessed(e) => serde_json::to_value(&e.data),
            Self::RecordEcosystemVersions(e) => serde_json::to_value(&e.data),
            Self::RecordUpdateJobError(e) => serde_json::to_value(&e.data),
            Self::IncrementMetric(e) => serde_json::to_value(&e.data),
        }
    }

    /// The commit reported by a `mark_as_processed` call.
    pub fn processed_commit(&self) -> Option<&str> {
        match self {
            Self::MarkAsProcessed(e) => Some(e.data.base_commit_sha.as_str()),
            _ => None,
        }
    }
}
