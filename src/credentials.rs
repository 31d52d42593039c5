//! Credential preparation.
//!
//! Credentials arrive with `$VAR` placeholders so fixtures never hold secrets.
//! The run keeps the original list for recorded output and expands a private
//! copy right before handing it to the security gate and the proxy.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::model::{Allowed, Credential, Input};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("valid placeholder regex")
});

/// Replace `$VAR` and `${VAR}` with values from `lookup`; unknown names become empty.
pub fn expand_placeholders(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    PLACEHOLDER
        .replace_all(value, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(name).unwrap_or_default()
        })
        .into_owned()
}

/// Expand string fields of every credential on a fresh copy.
pub fn expand_credentials(
    credentials: &[Credential],
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<Credential> {
    credentials
        .iter()
        .map(|credential| {
            let mut expanded = credential.clone();
            for value in expanded.values_mut() {
                if let Value::String(s) = value {
                    *s = expand_placeholders(s, &lookup);
                }
            }
            expanded
        })
        .collect()
}

/// Expand from the process environment.
pub fn expand_from_env(credentials: &[Credential]) -> Vec<Credential> {
    expand_credentials(credentials, |name| std::env::var(name).ok())
}

/// Registry credential type used by Azure Artifacts for each package manager.
fn azure_artifacts_type(package_manager: &str) -> Option<&'static str> {
    match package_manager {
        "gradle" | "maven" => Some("maven_repository"),
        "npm_and_yarn" => Some("npm_registry"),
        "nuget" => Some("nuget_feed"),
        "pip" => Some("python_index"),
        _ => None,
    }
}

/// An Azure DevOps repository path, `org/project/_git/repo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureRepo {
    pub org: String,
    pub project: String,
    pub repo: String,
}

impl AzureRepo {
    pub fn parse(repo: &str) -> Option<Self> {
        let parts: Vec<&str> = repo.split('/').collect();
        match parts.as_slice() {
            [org, project, _, repo] => Some(Self {
                org: (*org).to_string(),
                project: (*project).to_string(),
                repo: (*repo).to_string(),
            }),
            _ => None,
        }
    }
}

/// Which convenience tokens are present locally. Only presence matters: the
/// injected credentials reference the variable by name.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTokens {
    pub github: bool,
    pub azure: bool,
}

fn token_credential(kind: &str, host: &str, username: &str, variable: &str) -> Credential {
    Credential::new()
        .with("type", kind)
        .with("host", host)
        .with("username", username)
        .with("password", format!("${variable}"))
}

/// Normalize a job input before a run.
///
/// Fills nil collections, injects convenience credentials for locally
/// available tokens and recomputes the job's credential metadata.
pub fn normalize_input(input: &mut Input, tokens: LocalTokens, api_url: Option<&str>) {
    let job = &mut input.job;
    if job.allowed_updates.is_empty() {
        job.allowed_updates = vec![Allowed::all()];
    }

    let azure_repo = AzureRepo::parse(&job.source.repo);
    let has_git_source = input
        .credentials
        .iter()
        .any(|c| c.kind() == Some("git_source"));

    if tokens.azure
        && let (Some(api_url), Some(azure)) = (api_url, azure_repo.as_ref())
        && let Some(host) = url::Url::parse(api_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    {
        input.credentials.push(token_credential(
            "git_source",
            &host,
            &azure.org,
            "LOCAL_AZURE_ACCESS_TOKEN",
        ));
    }

    if tokens.github && !has_git_source {
        tracing::info!("Inserting $LOCAL_GITHUB_ACCESS_TOKEN into credentials");
        input.credentials.push(token_credential(
            "git_source",
            "github.com",
            "x-access-token",
            "LOCAL_GITHUB_ACCESS_TOKEN",
        ));
    }

    if tokens.azure
        && !has_git_source
        && let Some(azure) = azure_repo.as_ref()
    {
        tracing::info!(org = %azure.org, "Inserting $LOCAL_AZURE_ACCESS_TOKEN into credentials");
        for host in [
            "dev.azure.com".to_string(),
            format!("{}.visualstudio.com", azure.org),
        ] {
            input.credentials.push(token_credential(
                "git_source",
                &host,
                "x-access-token",
                "LOCAL_AZURE_ACCESS_TOKEN",
            ));
        }
    }

    // The updater never sees secrets, only this projection.
    input.job.credentials_metadata = input.credentials.iter().map(Credential::metadata).collect();

    if tokens.azure
        && let Some(azure) = azure_repo.as_ref()
    {
        match azure_artifacts_type(&input.job.package_manager) {
            Some(kind) => {
                for host in [
                    "pkgs.dev.azure.com".to_string(),
                    format!("{}.pkgs.visualstudio.com", azure.org),
                ] {
                    input.credentials.push(token_credential(
                        kind,
                        &host,
                        "x-access-token",
                        "LOCAL_AZURE_ACCESS_TOKEN",
                    ));
                }
            }
            None => tracing::info!(
                package_manager = %input.job.package_manager,
                "Skipping Azure Artifacts credentials"
            ),
        }
    }
}
