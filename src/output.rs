//! Recording a run as a scenario file.
//!
//! The recorded scenario pairs the job (with any commit the updater
//! reported) with the messages the control plane accepted, so a later
//! `test` run can replay it deterministically.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use similar::TextDiff;

use crate::api::ApiReport;
use crate::error::OutputError;
use crate::model::{Condition, Credential, Job, Message};

/// Package managers without versioned dependencies.
const UNVERSIONED_PACKAGE_MANAGERS: [&str; 1] = ["submodules"];

/// Serialization chosen from the output file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Add a `> version` ignore condition for every dependency the updater
/// proposed, so replays do not propose the same update again.
pub fn synthesize_ignore_conditions(job: &mut Job, recorded: &[Message], source: &str) {
    for message in recorded {
        let Message::CreatePullRequest(envelope) = message else {
            continue;
        };
        for dependency in &envelope.data.dependencies {
            if dependency.removed {
                continue;
            }
            let Some(version) = dependency.version.as_deref() else {
                continue;
            };
            job.ignore_conditions.push(Condition {
                dependency_name: dependency.name.clone(),
                version_requirement: format!(">{version}"),
                source: source.to_string(),
                ..Default::default()
            });
        }
    }
}

/// Build the recorded scenario document.
///
/// `credentials` must be the unexpanded list so secrets never reach the file.
pub fn recorded_scenario(
    job: &Job,
    credentials: &[Credential],
    report: &ApiReport,
    output_path: Option<&Path>,
) -> Result<Value, OutputError> {
    let mut job = job.clone();
    if job.source.commit().is_none()
        && let Some(commit) = report.processed_commit.as_deref()
    {
        job.source.commit = Some(commit.to_string());
    }

    if job.ignore_conditions.is_empty()
        && !UNVERSIONED_PACKAGE_MANAGERS.contains(&job.package_manager.as_str())
    {
        let source = output_path
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        synthesize_ignore_conditions(&mut job, &report.recorded, &source);
    }

    let serialize = |e: serde_json::Error| OutputError::Serialize(e.to_string());
    let mut input = json!({ "job": job.fixture_value().map_err(serialize)? });
    if !credentials.is_empty() {
        input["credentials"] = serde_json::to_value(credentials).map_err(serialize)?;
    }
    Ok(json!({
        "input": input,
        "output": serde_json::to_value(&report.recorded).map_err(serialize)?,
    }))
}

pub fn render(scenario: &Value, format: Format) -> Result<String, OutputError> {
    match format {
        Format::Yaml => {
            serde_yaml::to_string(scenario).map_err(|e| OutputError::Serialize(e.to_string()))
        }
        Format::Json => serde_json::to_string_pretty(scenario)
            .map(|mut s| {
                s.push('\n');
                s
            })
            .map_err(|e| OutputError::Serialize(e.to_string())),
    }
}

/// Unified diff between the input document and the recorded output.
pub fn unified_diff(input_name: &str, output_name: &str, input: &str, output: &str) -> String {
    TextDiff::from_lines(input, output)
        .unified_diff()
        .context_radius(3)
        .header(input_name, output_name)
        .to_string()
}

/// The output file, opened before the run so an unwritable path fails fast.
///
/// Opening does not truncate: a run that dies early leaves the previous
/// scenario in place.
#[derive(Debug)]
pub struct OutputFile {
    path: PathBuf,
    file: File,
}

impl OutputFile {
    pub fn open(path: &Path) -> Result<Self, OutputError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> Format {
        Format::from_path(&self.path)
    }

    /// Replace the file's contents.
    pub fn replace(&mut self, contents: &str) -> Result<(), OutputError> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(contents.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}
