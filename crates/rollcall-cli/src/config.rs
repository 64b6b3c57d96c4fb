use anyhow::{Context, Result};
use rollcall_core::enroll::{DEFAULT_MAX_TERM, DEFAULT_UNITS};
use rollcall_core::resolver::DEFAULT_THRESHOLD;
use rollcall_core::types::EMBEDDING_DIM;
use rollcall_core::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Optional TOML config file. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    similarity_threshold: Option<f32>,
    embedding_dim: Option<usize>,
    units: Option<Vec<String>>,
    max_term: Option<u8>,
    notify_enabled: Option<bool>,
    notify_outbox: Option<PathBuf>,
    notify_grace_ms: Option<u64>,
}

/// CLI configuration: defaults, then the TOML file, then `ROLLCALL_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Expected embedding length.
    pub embedding_dim: usize,
    /// Units accepted at enrollment.
    pub units: Vec<String>,
    /// Highest term accepted at enrollment.
    pub max_term: u8,
    /// Whether absence notices are delivered at all.
    pub notify_enabled: bool,
    /// JSON-lines outbox for an external mailer; log-only delivery when unset.
    pub notify_outbox: Option<PathBuf>,
    /// How long to wait for pending notices at exit.
    pub notify_grace_ms: u64,
}

impl Config {
    /// Load the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(|| config_dir().join("config.toml"));

        let file = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let file: FileConfig =
                toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;
            tracing::debug!(path = %path.display(), "loaded config file");
            file
        } else {
            if explicit.is_some() {
                anyhow::bail!("config file {} does not exist", path.display());
            }
            FileConfig::default()
        };

        Ok(Self::from_sources(file, |key| std::env::var(key).ok()))
    }

    fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let db_path = env("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| data_dir(&env).join("attendance.db"));

        let units = env("ROLLCALL_UNITS")
            .map(|v| {
                v.split(',')
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|units| !units.is_empty())
            .or(file.units)
            .unwrap_or_else(|| DEFAULT_UNITS.iter().map(|u| u.to_string()).collect());

        Self {
            db_path,
            similarity_threshold: env_parse(&env, "ROLLCALL_SIMILARITY_THRESHOLD")
                .or(file.similarity_threshold)
                .unwrap_or(DEFAULT_THRESHOLD),
            embedding_dim: env_parse(&env, "ROLLCALL_EMBEDDING_DIM")
                .or(file.embedding_dim)
                .unwrap_or(EMBEDDING_DIM),
            units,
            max_term: env_parse(&env, "ROLLCALL_MAX_TERM")
                .or(file.max_term)
                .unwrap_or(DEFAULT_MAX_TERM),
            notify_enabled: env("ROLLCALL_NOTIFY_ENABLED")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .or(file.notify_enabled)
                .unwrap_or(false),
            notify_outbox: env("ROLLCALL_NOTIFY_OUTBOX")
                .map(PathBuf::from)
                .or(file.notify_outbox),
            notify_grace_ms: env_parse(&env, "ROLLCALL_NOTIFY_GRACE_MS")
                .or(file.notify_grace_ms)
                .unwrap_or(2000),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            threshold: self.similarity_threshold,
            embedding_dim: self.embedding_dim,
            units: self.units.clone(),
            max_term: self.max_term,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.trim().parse().ok())
}

fn data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(env).join(".local/share"))
        .join("rollcall")
}

fn config_dir() -> PathBuf {
    let env = |key: &str| std::env::var(key).ok();
    env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(&env).join(".config"))
        .join("rollcall")
}

fn home(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    PathBuf::from(env("HOME").unwrap_or_else(|| "/tmp".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(FileConfig::default(), env_of(&[("HOME", "/home/t")]));
        assert_eq!(config.db_path, PathBuf::from("/home/t/.local/share/rollcall/attendance.db"));
        assert_eq!(config.similarity_threshold, 0.40);
        assert_eq!(config.embedding_dim, 512);
        assert_eq!(config.units.len(), 9);
        assert_eq!(config.max_term, 7);
        assert!(!config.notify_enabled);
        assert!(config.notify_outbox.is_none());
        assert_eq!(config.notify_grace_ms, 2000);
    }

    #[test]
    fn test_file_then_env_precedence() {
        let file: FileConfig = toml::from_str(
            r#"
            db_path = "/srv/rollcall.db"
            similarity_threshold = 0.5
            units = ["CS", "EC"]
            notify_enabled = true
            "#,
        )
        .unwrap();

        let config = Config::from_sources(
            file,
            env_of(&[("ROLLCALL_SIMILARITY_THRESHOLD", "0.45"), ("ROLLCALL_UNITS", "ME, CE ,")]),
        );
        assert_eq!(config.db_path, PathBuf::from("/srv/rollcall.db"));
        assert_eq!(config.similarity_threshold, 0.45);
        assert_eq!(config.units, vec!["ME", "CE"]);
        assert!(config.notify_enabled);
    }

    #[test]
    fn test_unparseable_env_falls_back() {
        let config = Config::from_sources(
            FileConfig::default(),
            env_of(&[("ROLLCALL_MAX_TERM", "eight"), ("ROLLCALL_NOTIFY_ENABLED", "0"), ("XDG_DATA_HOME", "/d")]),
        );
        assert_eq!(config.max_term, 7);
        assert!(!config.notify_enabled);
        assert_eq!(config.db_path, PathBuf::from("/d/rollcall/attendance.db"));
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(toml::from_str::<FileConfig>("colour = \"blue\"").is_err());
    }

    #[test]
    fn test_engine_config_mirrors_fields() {
        let config = Config::from_sources(FileConfig::default(), env_of(&[("ROLLCALL_EMBEDDING_DIM", "128")]));
        let engine = config.engine_config();
        assert_eq!(engine.embedding_dim, 128);
        assert_eq!(engine.threshold, config.similarity_threshold);
    }
}
