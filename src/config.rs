use crate::deps;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFailure,
    Always,
}

impl RestartPolicy {
    fn parse(value: &str) -> Option<RestartPolicy> {
        match value {
            "never" => Some(RestartPolicy::Never),
            "on-failure" => Some(RestartPolicy::OnFailure),
            "always" => Some(RestartPolicy::Always),
            _ => None,
        }
    }
}

/// A single service definition. `working_dir` is always absolute by the time
/// a `Service` exists; relative paths are resolved against the directory of
/// the config file during load.
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub name: String,
    pub command: String,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub restart: RestartPolicy,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub services: HashMap<String, Service>,
}

impl Config {
    /// Service names in a stable order.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    services: HashMap<String, RawService>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawService {
    command: Option<String>,
    working_dir: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    restart: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("no services defined")]
    NoServices,
    #[error("service {name:?}: command is required")]
    CommandRequired { name: String },
    #[error("service {name:?}: invalid restart policy: {value:?}")]
    InvalidRestartPolicy { name: String, value: String },
    #[error("service {name:?}: unknown dependency: {dep:?}")]
    UnknownDependency { name: String, dep: String },
    #[error("circular dependency detected: [{}]", cycle.join(", "))]
    CircularDependency { cycle: Vec<String> },
}

/// Read and validate a config file. Relative working directories are
/// resolved against the config file's own directory.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Read(format!("{}: {e}", path.display())))?;

    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| ConfigError::Read(e.to_string()))?
            .join(path)
    };
    let base_dir = abs.parent().unwrap_or(Path::new("/")).to_path_buf();

    parse(&content, &base_dir)
}

/// Parse and validate config content against a base directory.
pub fn parse(content: &str, base_dir: &Path) -> Result<Config, ConfigError> {
    let raw: RawConfig =
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

    if raw.services.is_empty() {
        return Err(ConfigError::NoServices);
    }

    let mut services = HashMap::new();
    let mut names: Vec<&String> = raw.services.keys().collect();
    names.sort(); // deterministic validation error order

    for name in names {
        let raw_svc = &raw.services[name];

        let Some(command) = raw_svc.command.clone().filter(|c| !c.is_empty()) else {
            return Err(ConfigError::CommandRequired { name: name.clone() });
        };

        let restart = match &raw_svc.restart {
            None => RestartPolicy::default(),
            Some(value) => RestartPolicy::parse(value).ok_or_else(|| {
                ConfigError::InvalidRestartPolicy {
                    name: name.clone(),
                    value: value.clone(),
                }
            })?,
        };

        for dep in &raw_svc.depends_on {
            if !raw.services.contains_key(dep) {
                return Err(ConfigError::UnknownDependency {
                    name: name.clone(),
                    dep: dep.clone(),
                });
            }
        }

        let working_dir = match &raw_svc.working_dir {
            Some(dir) => {
                let p = Path::new(dir);
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    base_dir.join(p)
                }
            }
            None => base_dir.to_path_buf(),
        };

        services.insert(
            name.clone(),
            Service {
                name: name.clone(),
                command,
                working_dir,
                env: raw_svc.env.clone(),
                restart,
                depends_on: raw_svc.depends_on.clone(),
            },
        );
    }

    if let Some(cycle) = deps::detect_cycle(&services) {
        return Err(ConfigError::CircularDependency { cycle });
    }

    Ok(Config { services })
}
