use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use conduit_model::EngineConfig;
use tracing::{debug, info};

use crate::validation::{ConfigWarnings, apply_guard_rails};

pub const CONFIG_PATH_ENV: &str = "CONDUIT_CONFIG_PATH";
pub const CONFIG_JSON_ENV: &str = "CONDUIT_CONFIG_JSON";

const CANDIDATES: &[&str] = &[
    "conduit.toml",
    "conduit.json",
    "config/conduit.toml",
    "config/conduit.json",
];

/// Where the engine configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    /// Path passed explicitly (command line or `$CONDUIT_CONFIG_PATH`).
    Path(PathBuf),
    /// Inline JSON from `$CONDUIT_CONFIG_JSON`.
    EnvInline,
    /// One of the default file candidates.
    File(PathBuf),
}

/// Validated configuration plus the non-fatal findings of the guard rails.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: EngineConfig,
    pub source: ConfigSource,
    pub warnings: ConfigWarnings,
}

/// Resolves the engine configuration.
///
/// Evaluation order:
/// 1) an explicit path (TOML or JSON file),
/// 2) inline JSON,
/// 3) the first default candidate found under the search root,
/// 4) built-in defaults.
///
/// The resolved configuration is then run through [`apply_guard_rails`];
/// a guard-rail violation fails the load.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
    inline_json: Option<String>,
    search_root: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader seeded from `$CONDUIT_CONFIG_PATH` and `$CONDUIT_CONFIG_JSON`.
    pub fn from_env() -> Self {
        let non_empty = |key: &str| {
            env::var(key).ok().filter(|value| !value.trim().is_empty())
        };
        Self {
            path: non_empty(CONFIG_PATH_ENV).map(PathBuf::from),
            inline_json: non_empty(CONFIG_JSON_ENV),
            search_root: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_inline_json(mut self, raw: impl Into<String>) -> Self {
        self.inline_json = Some(raw.into());
        self
    }

    /// Directory the default candidates are resolved against. Defaults to
    /// the working directory.
    pub fn with_search_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.search_root = Some(root.into());
        self
    }

    pub fn load(&self) -> anyhow::Result<ConfigLoad> {
        let (config, source) = self.resolve()?;
        let warnings = apply_guard_rails(&config).with_context(|| {
            format!("configuration from {} rejected", describe(&source))
        })?;
        info!(
            target: "conduit::config",
            source = %describe(&source),
            pool_size = config.pool.pool_size,
            warnings = warnings.items.len(),
            "engine configuration loaded"
        );
        Ok(ConfigLoad {
            config,
            source,
            warnings,
        })
    }

    fn resolve(&self) -> anyhow::Result<(EngineConfig, ConfigSource)> {
        if let Some(path) = &self.path {
            let config = load_from_file(path)?;
            return Ok((config, ConfigSource::Path(path.clone())));
        }

        if let Some(raw) = &self.inline_json {
            let config = parse_json(raw)
                .with_context(|| format!("failed to parse {CONFIG_JSON_ENV}"))?;
            return Ok((config, ConfigSource::EnvInline));
        }

        if let Some(path) = self.find_default_file() {
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        debug!(target: "conduit::config", "no configuration found; using defaults");
        Ok((EngineConfig::default(), ConfigSource::Default))
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        let root = self.search_root.as_deref().unwrap_or(Path::new(""));
        CANDIDATES
            .iter()
            .map(|candidate| root.join(candidate))
            .find(|path| path.is_file())
    }
}

/// Shorthand for `ConfigLoader::from_env().load()`.
pub fn load_from_env() -> anyhow::Result<ConfigLoad> {
    ConfigLoader::from_env().load()
}

pub fn load_from_file(path: &Path) -> anyhow::Result<EngineConfig> {
    let contents = fs::read_to_string(path).with_context(|| {
        format!("failed to read engine config from {}", path.display())
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&contents)
            .with_context(|| format!("invalid engine config {}", path.display())),
        Some("toml") | Some("tml") => toml::from_str(&contents).map_err(|err| {
            anyhow!("invalid engine config {}: {}", path.display(), err)
        }),
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

/// Parses either format, trying TOML first.
pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<EngineConfig> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse engine config {}: toml error: {}; json error: {}",
                origin,
                toml_err,
                json_err
            )
        })
    })
}

pub fn parse_json(raw: &str) -> anyhow::Result<EngineConfig> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid engine config json: {err}"))
}

fn describe(source: &ConfigSource) -> String {
    match source {
        ConfigSource::Default => "defaults".to_string(),
        ConfigSource::Path(path) | ConfigSource::File(path) => {
            path.display().to_string()
        }
        ConfigSource::EnvInline => CONFIG_JSON_ENV.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensionless_content_falls_back_to_json() {
        let config =
            parse_from_str(r#"{"pool":{"pool_size":3}}"#, "inline").unwrap();
        assert_eq!(config.pool.pool_size, 3);
    }

    #[test]
    fn unparseable_content_reports_both_formats() {
        let err = parse_from_str("pool = [", "broken").unwrap_err().to_string();
        assert!(err.contains("toml error"), "{err}");
        assert!(err.contains("json error"), "{err}");
    }
}
