use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::sync::coordinator::DEFAULT_DEBOUNCE;
use crate::sync::paths::normalize_remote_path;

const DEFAULT_APP_CONFIG: &str = "./config/app.json";
const DEFAULT_DIST_FOLDER: &str = "./dist";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    MissingEnv(&'static str),
    #[error("failed to read app config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid app config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("app config `spFolder` is empty")]
    EmptyFolder,
    #[error("invalid site url: {0}")]
    SiteUrl(#[from] url::ParseError),
}

/// Project settings from `config/app.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub sp_folder: String,
    #[serde(default = "default_dist_folder")]
    pub dist_folder: String,
    #[serde(default)]
    pub delete_files: bool,
    #[serde(default)]
    pub custom_actions: Vec<CustomActionDefinition>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CustomActionDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub script_src: String,
    #[serde(default)]
    pub scope: ActionScope,
    #[serde(default)]
    pub sequence: i32,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionScope {
    #[default]
    Web,
    Site,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub site_url: Url,
    pub token: String,
    pub sp_folder: String,
    pub dist_folder: PathBuf,
    pub delete_files: bool,
    pub debounce: Duration,
    pub custom_actions: Vec<CustomActionDefinition>,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let app_config = std::env::var("SPSYNC_APP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_APP_CONFIG));
        let app = AppConfig::load(&app_config)?;
        Self::from_parts(app, |name| std::env::var(name).ok())
    }

    /// Builds the config from an app config and an environment lookup.
    pub fn from_parts(
        app: AppConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let site_url = lookup("SPSYNC_SITE_URL").ok_or(ConfigError::MissingEnv("SPSYNC_SITE_URL"))?;
        let site_url = Url::parse(site_url.trim_end_matches('/'))?;
        let token = lookup("SPSYNC_TOKEN").ok_or(ConfigError::MissingEnv("SPSYNC_TOKEN"))?;

        let sp_folder = compile_env_template(&app.sp_folder, &lookup);
        if sp_folder.trim_matches('/').is_empty() {
            return Err(ConfigError::EmptyFolder);
        }
        let dist_folder = PathBuf::from(compile_env_template(&app.dist_folder, &lookup));
        let delete_files = lookup("SPSYNC_DELETE_FILES")
            .map(|value| parse_bool(&value))
            .unwrap_or(app.delete_files);
        let debounce = lookup("SPSYNC_DEBOUNCE_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_DEBOUNCE);

        Ok(Self {
            site_url,
            token,
            sp_folder,
            dist_folder,
            delete_files,
            debounce,
            custom_actions: app.custom_actions,
        })
    }

    /// Site path joined with the publish folder, e.g. `/sites/dev/Style Library/app`.
    pub fn publish_root(&self) -> String {
        normalize_remote_path(&format!("{}/{}", self.site_url.path(), self.sp_folder))
    }
}

/// Expands `{{NAME:default}}` placeholders from the environment, falling back
/// to the default and then to an empty string.
pub fn compile_env_template(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let inner = &rest[start + 2..start + 2 + len];
        let (name, default) = inner.split_once(':').unwrap_or((inner, ""));
        out.push_str(&rest[..start]);
        match lookup(name).filter(|value| !value.is_empty()) {
            Some(value) => out.push_str(&value),
            None => out.push_str(default),
        }
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    out
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_dist_folder() -> String {
    DEFAULT_DIST_FOLDER.to_string()
}
