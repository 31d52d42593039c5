//! Harness configuration.
//!
//! Defaults come from environment variables (loaded from `.env` by the binary
//! via `dotenvy`); image names can be overridden per run.

use std::collections::HashMap;

use crate::error::ConfigError;
use crate::sandbox::RegistryAuth;

/// Prefix of the per-ecosystem updater images.
pub const UPDATER_IMAGE_PREFIX: &str = "ghcr.io/dependabot/dependabot-updater-";

/// Default image for the credential-injecting proxy.
pub const PROXY_IMAGE: &str =
    "ghcr.io/github/dependabot-update-job-proxy/dependabot-update-job-proxy:latest";

/// Default image for the telemetry collector side-car.
pub const COLLECTOR_IMAGE: &str = "ghcr.io/open-telemetry/opentelemetry-collector-releases/opentelemetry-collector-contrib:latest";

/// Default image for the case-insensitive storage side-car.
pub const STORAGE_IMAGE: &str = "ghcr.io/dependabot/dependabot-storage";

/// API used for token scope checks when the job names none.
pub const DEFAULT_API_ENDPOINT: &str = "https://api.github.com";

/// Job id reported to the updater and proxy.
pub const DEFAULT_JOB_ID: &str = "cli";

const PACKAGE_MANAGERS: [(&str, &str); 18] = [
    ("bundler", "bundler"),
    ("cargo", "cargo"),
    ("composer", "composer"),
    ("pub", "pub"),
    ("docker", "docker"),
    ("elm", "elm"),
    ("github_actions", "github-actions"),
    ("submodules", "gitsubmodule"),
    ("go_modules", "gomod"),
    ("gradle", "gradle"),
    ("maven", "maven"),
    ("hex", "mix"),
    ("nuget", "nuget"),
    ("npm_and_yarn", "npm"),
    ("pip", "pip"),
    ("terraform", "terraform"),
    ("swift", "swift"),
    ("devcontainers", "devcontainers"),
];

/// Maps package-manager identifiers to updater images.
#[derive(Debug, Clone)]
pub struct ImageTable {
    prefix: String,
    suffixes: HashMap<String, String>,
}

impl Default for ImageTable {
    fn default() -> Self {
        Self::new(UPDATER_IMAGE_PREFIX, PACKAGE_MANAGERS)
    }
}

impl ImageTable {
    pub fn new<K, V>(prefix: impl Into<String>, entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            prefix: prefix.into(),
            suffixes: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// The updater image for a package manager.
    pub fn updater_image(&self, package_manager: &str) -> Result<String, ConfigError> {
        self.suffixes
            .get(package_manager)
            .map(|suffix| format!("{}{}", self.prefix, suffix))
            .ok_or_else(|| ConfigError::UnknownPackageManager(package_manager.to_string()))
    }
}

/// Process-wide settings that do not vary per job.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Address the control-plane mock binds to.
    pub api_host: String,
    /// Port for the control-plane mock; `0` picks a free one.
    pub api_port: u16,
    /// Job id handed to the updater.
    pub job_id: String,
    /// `LOCAL_GITHUB_ACCESS_TOKEN`, used for convenience credentials and ghcr.io pulls.
    pub github_token: Option<String>,
    /// `LOCAL_AZURE_ACCESS_TOKEN`, used for Azure DevOps convenience credentials.
    pub azure_token: Option<String>,
    /// Credentials for `*.azurecr.io` pulls.
    pub azure_registry: Option<RegistryAuth>,
    pub proxy_image: String,
    pub collector_image: String,
    pub storage_image: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            api_host: default_api_host().to_string(),
            api_port: 0,
            job_id: DEFAULT_JOB_ID.to_string(),
            github_token: None,
            azure_token: None,
            azure_registry: None,
            proxy_image: PROXY_IMAGE.to_string(),
            collector_image: COLLECTOR_IMAGE.to_string(),
            storage_image: STORAGE_IMAGE.to_string(),
        }
    }
}

/// Containers reach the mock through the host gateway, which on Linux needs
/// every interface.
fn default_api_host() -> &'static str {
    if cfg!(target_os = "linux") {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl HarnessConfig {
    /// Build from environment variables, keeping defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(host) = env_non_empty("FAKE_API_HOST") {
            config.api_host = host;
        }
        if let Some(port) = env_non_empty("FAKE_API_PORT") {
            config.api_port = port.parse().map_err(|_| {
                ConfigError::InvalidInput(format!("FAKE_API_PORT is not a port: {port}"))
            })?;
        }
        if let Some(job_id) = env_non_empty("DEPENDABOT_JOB_ID") {
            config.job_id = job_id;
        }
        config.github_token = env_non_empty("LOCAL_GITHUB_ACCESS_TOKEN");
        config.azure_token = env_non_empty("LOCAL_AZURE_ACCESS_TOKEN");
        if let (Some(username), Some(password)) = (
            env_non_empty("AZURE_REGISTRY_USERNAME"),
            env_non_empty("AZURE_REGISTRY_PASSWORD"),
        ) {
            config.azure_registry = Some(RegistryAuth {
                username,
                password,
                server: None,
            });
        }
        Ok(config)
    }

    /// Registry credentials for pulling `image`, if any are configured.
    pub fn registry_auth(&self, image: &str) -> Option<RegistryAuth> {
        if image.starts_with("ghcr.io/") {
            return self.github_token.as_ref().map(|token| RegistryAuth {
                username: "x".to_string(),
                password: token.clone(),
                server: Some("ghcr.io".to_string()),
            });
        }
        if image.contains(".azurecr.io/") {
            let registry = image.split('/').next().unwrap_or_default().to_string();
            return self.azure_registry.as_ref().map(|auth| RegistryAuth {
                server: Some(registry),
                ..auth.clone()
            });
        }
        None
    }
}
