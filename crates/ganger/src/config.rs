//! Profile configuration file (TOML-based).
//!
//! A [`ProfileConfig`] is the on-disk form of a [`BootstrapProfile`], so
//! deployments can describe their workers without code:
//!
//! ```toml
//! [worker]
//! modules = ["billing"]
//! constructor_arguments = ["eu", 4]
//!
//! [admin]
//! cookie = "s3cret"
//! kill_switch = "/var/run/ganger-kill.json"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ganger_wire::Encoding;

use crate::bootstrap::BootstrapProfile;
use crate::error::{Result, WorkerError};
use crate::socket::SocketContext;

/// Main profile configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Runner executable configuration
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Worker construction configuration
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Channel configuration
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Socket tuning
    #[serde(default)]
    pub socket: SocketConfig,
    /// Administrative control plane
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Runner executable (defaults to the current executable)
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Leading runner arguments (defaults to the worker marker flag)
    #[serde(default)]
    pub arguments: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Variable name bound in the launcher document
    #[serde(default = "default_variable")]
    pub variable: String,
    /// Modules to require before construction
    #[serde(default)]
    pub modules: Vec<String>,
    /// Constructor arguments as JSON values
    #[serde(default)]
    pub constructor_arguments: Vec<Value>,
    /// Account to switch to at launch time
    #[serde(default)]
    pub identity: Option<String>,
    /// Stage-1 directive lines, emitted before the module requires
    #[serde(default)]
    pub stage1: Vec<String>,
    /// Stage-2 directive lines, emitted before construction
    #[serde(default)]
    pub stage2: Vec<String>,
    /// Stage-3 directive lines, emitted after construction
    #[serde(default)]
    pub stage3: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Wire encoding: "framed" or "lines"
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Listen backlog
    #[serde(default)]
    pub backlog: Option<u32>,
    /// TCP_NODELAY
    #[serde(default)]
    pub nodelay: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Cookie authorizing stop and query operations
    #[serde(default)]
    pub cookie: Option<String>,
    /// Kill-switch file path
    #[serde(default)]
    pub kill_switch: Option<PathBuf>,
}

// --- Defaults ---

fn default_variable() -> String {
    "workerImpl".into()
}

fn default_encoding() -> String {
    Encoding::Framed.to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            variable: default_variable(),
            modules: vec![],
            constructor_arguments: vec![],
            identity: None,
            stage1: vec![],
            stage2: vec![],
            stage3: vec![],
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            encoding: default_encoding(),
        }
    }
}

impl ProfileConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|err| {
            WorkerError::Config(format!("could not parse {}: {err}", path.display()))
        })?;
        Ok(config)
    }

    /// Load from `path`, or return defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            Self::load(path).unwrap_or_default()
        } else {
            Self::default()
        }
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|err| WorkerError::Config(format!("could not serialize: {err}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Build the equivalent [`BootstrapProfile`].
    pub fn into_profile(self) -> Result<BootstrapProfile> {
        let mut profile = BootstrapProfile::new();
        if let Some(executable) = self.runner.executable {
            profile.set_runner_executable(executable);
        }
        profile.set_runner_arguments(self.runner.arguments);
        profile.set_variable_name(self.worker.variable);
        profile.set_preferred_identity(self.worker.identity);
        for module in self.worker.modules {
            profile.add_module(module);
        }
        for value in self.worker.constructor_arguments {
            profile.add_constructor_argument_with_value(value);
        }
        for line in self.worker.stage1 {
            profile.add_stage1_part(line);
        }
        for line in self.worker.stage2 {
            profile.add_stage2_part(line);
        }
        for line in self.worker.stage3 {
            profile.add_stage3_part(line);
        }
        let encoding = self
            .channel
            .encoding
            .parse::<Encoding>()
            .map_err(WorkerError::Config)?;
        profile.set_encoding(encoding);
        let context = SocketContext {
            backlog: self.socket.backlog,
            nodelay: self.socket.nodelay,
        };
        if context != SocketContext::default() {
            profile.set_socket_context(Some(context));
        }
        profile.set_admin_cookie(self.admin.cookie);
        profile.set_kill_switch_path(self.admin.kill_switch);
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProfileConfig::default();
        assert_eq!(config.worker.variable, "workerImpl");
        assert_eq!(config.channel.encoding, "framed");
        assert!(config.admin.cookie.is_none());
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = ProfileConfig::default();
        config.admin.cookie = Some("s3cret".into());
        config.worker.modules.push("billing".into());
        let toml = toml::to_string_pretty(&config).expect("serialize");
        let parsed: ProfileConfig = toml::from_str(&toml).expect("deserialize");
        assert_eq!(parsed.admin.cookie.as_deref(), Some("s3cret"));
        assert_eq!(parsed.worker.modules, vec!["billing".to_owned()]);
    }

    #[test]
    fn test_into_profile_carries_every_section() {
        let config: ProfileConfig = toml::from_str(
            r#"
            [worker]
            modules = ["billing"]
            constructor_arguments = ["eu", 4]

            [channel]
            encoding = "lines"

            [socket]
            nodelay = true

            [admin]
            cookie = "s3cret"
            kill_switch = "/tmp/kill.json"
            "#,
        )
        .expect("parse");

        let profile = config.into_profile().expect("convert");
        assert_eq!(profile.generate_expression("Invoice"), r#"new Invoice("eu", 4)"#);
        assert_eq!(profile.encoding(), Encoding::Lines);
        assert_eq!(profile.admin_cookie(), Some("s3cret"));
        assert_eq!(
            profile.socket_context(),
            Some(&SocketContext {
                backlog: None,
                nodelay: Some(true),
            })
        );
        assert_eq!(
            profile.kill_switch_path(),
            Some(Path::new("/tmp/kill.json"))
        );
    }

    #[test]
    fn test_unknown_encoding_is_a_config_error() {
        let config: ProfileConfig = toml::from_str("[channel]\nencoding = \"morse\"\n")
            .expect("parse");
        assert!(matches!(
            config.into_profile(),
            Err(WorkerError::Config(_))
        ));
    }

    #[test]
    fn test_load_or_default_tolerates_a_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ProfileConfig::load_or_default(&dir.path().join("absent.toml"));
        assert_eq!(config.channel.encoding, "framed");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/profile.toml");
        let mut config = ProfileConfig::default();
        config.worker.identity = Some("ganger".into());
        config.save(&path).expect("save");

        let loaded = ProfileConfig::load(&path).expect("load");
        assert_eq!(loaded.worker.identity.as_deref(), Some("ganger"));
    }
}
