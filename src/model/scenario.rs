//! Scenario files: a job input plus the ordered output it is expected to produce.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::job::{Credential, Job};
use super::message::Message;
use crate::error::ConfigError;

/// What the harness feeds the updater.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Input {
    pub job: Job,
    pub credentials: Vec<Credential>,
}

/// An input and its ordered expected output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub input: Input,
    pub output: Vec<Message>,
}

/// Decode a document as JSON, falling back to YAML.
pub fn parse_document<T: DeserializeOwned>(data: &[u8]) -> Result<T, ConfigError> {
    match serde_json::from_slice(data) {
        Ok(value) => Ok(value),
        Err(_) => serde_yaml::from_slice(data)
            .map_err(|e| ConfigError::Parse(format!("failed to decode input file: {e}"))),
    }
}
