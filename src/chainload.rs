use std::cell::OnceCell;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

pub const CLASS_KEY: &str = "packwiz.chainload.class";
pub const ARTIFACT_KEY: &str = "packwiz.chainload.artifact";

/// Configuration file consulted after the environment.
pub const CONFIG_FILE_NAME: &str = "packwiz-installer-bootstrap.toml";

/// Entrypoint that takes over instead of the normal update+launch path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainloadTarget {
    None,
    /// A named entrypoint, looked up on `PATH`.
    Entrypoint(String),
    /// A path to an executable.
    Artifact(PathBuf),
}

#[derive(Debug, Error)]
pub enum ChainloadError {
    #[error("failed to read {}", path.display())]
    Read {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} is invalid", path.display())]
    Parse {
        path:   PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// A key/value provider. Empty values count as unset.
pub trait ConfigSource {
    fn name(&self) -> String;
    fn get(&self, key: &str) -> Result<Option<String>, ChainloadError>;
}

/// Process environment. `packwiz.chainload.class` is read from
/// `PACKWIZ_CHAINLOAD_CLASS`.
#[derive(Debug, Default)]
pub struct EnvSource {
    vars: HashMap<String, String>,
}

impl EnvSource {
    pub fn from_process() -> Self {
        // Non-UTF-8 variables cannot hold a chainload key.
        Self::from_vars(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn var_name(key: &str) -> String {
        key.replace('.', "_").to_ascii_uppercase()
    }
}

impl ConfigSource for EnvSource {
    fn name(&self) -> String {
        "environment".to_string()
    }

    fn get(&self, key: &str) -> Result<Option<String>, ChainloadError> {
        Ok(self
            .vars
            .get(&Self::var_name(key))
            .filter(|v| !v.is_empty())
            .cloned())
    }
}

/// TOML file, loaded on first lookup. Nested tables flatten to dotted keys,
/// so `[packwiz.chainload] class = "x"` and `"packwiz.chainload.class" = "x"`
/// are the same key. A missing file behaves as an empty one.
#[derive(Debug)]
pub struct FileSource {
    path:   PathBuf,
    values: OnceCell<HashMap<String, String>>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path:   path.into(),
            values: OnceCell::new(),
        }
    }

    fn values(&self) -> Result<&HashMap<String, String>, ChainloadError> {
        if let Some(values) = self.values.get() {
            return Ok(values);
        }
        let loaded = load_file(&self.path)?;
        Ok(self.values.get_or_init(|| loaded))
    }
}

impl ConfigSource for FileSource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn get(&self, key: &str) -> Result<Option<String>, ChainloadError> {
        Ok(self
            .values()?
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned())
    }
}

fn load_file(path: &Path) -> Result<HashMap<String, String>, ChainloadError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no chainload configuration file");
            return Ok(HashMap::new());
        }
        Err(source) => {
            return Err(ChainloadError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let table: toml::Table = text.parse().map_err(|source| ChainloadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let mut values = HashMap::new();
    flatten("", &table, &mut values);
    Ok(values)
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut HashMap<String, String>) {
    for (key, value) in table {
        let key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(nested) => flatten(&key, nested, out),
            toml::Value::String(s) => {
                out.insert(key, s.clone());
            }
            other => {
                out.insert(key, other.to_string());
            }
        }
    }
}

/// Decide whether to chainload. Sources are consulted in order and the first
/// one naming a target wins; within a source the class key beats the
/// artifact key.
pub fn resolve(sources: &[&dyn ConfigSource]) -> Result<ChainloadTarget, ChainloadError> {
    for source in sources {
        if let Some(class) = source.get(CLASS_KEY)? {
            debug!(source = %source.name(), %class, "chainload entrypoint configured");
            return Ok(ChainloadTarget::Entrypoint(class));
        }
        if let Some(artifact) = source.get(ARTIFACT_KEY)? {
            debug!(source = %source.name(), %artifact, "chainload artifact configured");
            return Ok(ChainloadTarget::Artifact(PathBuf::from(artifact)));
        }
    }
    Ok(ChainloadTarget::None)
}
