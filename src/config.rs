//! User configuration.
//!
//! Layered sources, later wins: built-in defaults, the TOML file at
//! `~/.config/atlas/config.toml` (or `$ATLAS_CONFIG_PATH`), then `ATLAS_*`
//! environment variables. Nested keys use a double underscore:
//! `ATLAS_AGENT__COMMAND` maps to `agent.command`.

use std::path::PathBuf;
use std::time::Duration;

use config::{Case, Config, File};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::AtlasError;
use crate::hook::RetentionPolicy;
use crate::model::{StepKind, TaskTemplate};
use crate::validate::ValidationOptions;

/// Deserialize a Vec<String> that also accepts a single string, so array
/// fields can be set from environment variables.
fn string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct StringOrVec;

    impl<'de> de::Visitor<'de> for StringOrVec {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("string or array of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![value.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(elem) = seq.next_element()? {
                vec.push(elem);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(StringOrVec)
}

/// Commands per validation stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ValidationConfig {
    #[serde(deserialize_with = "string_or_vec")]
    pub format: Vec<String>,
    #[serde(deserialize_with = "string_or_vec")]
    pub lint: Vec<String>,
    #[serde(deserialize_with = "string_or_vec")]
    pub test: Vec<String>,
    #[serde(deserialize_with = "string_or_vec")]
    pub pre_commit: Vec<String>,
    /// Per-command timeout in seconds.
    pub timeout_secs: Option<u64>,
    pub live_output: Option<bool>,
}

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;

/// AI agent command and prompt templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AgentConfig {
    /// e.g. `claude` or `codex`; unset disables AI steps.
    pub command: Option<String>,
    #[serde(deserialize_with = "string_or_vec")]
    pub args: Vec<String>,
    pub step_template: Option<String>,
    pub commit_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ForgeConfig {
    pub command: String,
    pub base_branch: String,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            command: "gh".to_string(),
            base_branch: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CiConfig {
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1800,
            poll_interval_secs: 30,
        }
    }
}

/// Hook retention windows in days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CleanupConfig {
    pub completed_days: i64,
    pub failed_days: i64,
    pub abandoned_days: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            completed_days: 30,
            failed_days: 7,
            abandoned_days: 7,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AtlasConfig {
    pub validation: ValidationConfig,
    pub agent: AgentConfig,
    pub forge: ForgeConfig,
    pub ci: CiConfig,
    pub cleanup: CleanupConfig,
    /// Interval checkpoints for long-running steps, in seconds.
    pub checkpoint_interval_secs: Option<u64>,
    /// Extra task templates: `[templates.<name>]` tables of
    /// `step-name = "step_kind"` in order.
    pub templates: IndexMap<String, IndexMap<String, String>>,
}

impl AtlasConfig {
    /// Resolve the config file path: `$ATLAS_CONFIG_PATH` else
    /// `<config-dir>/atlas/config.toml`.
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("ATLAS_CONFIG_PATH")
            && !path.is_empty()
        {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("atlas").join("config.toml"))
    }

    /// Load with the full source stack.
    pub fn load() -> Result<Self, AtlasError> {
        let mut builder = Config::builder();

        if let Some(config_path) = Self::config_path()
            && config_path.exists()
        {
            builder = builder.add_source(File::from(config_path));
        }

        // ATLAS_VALIDATION__TIMEOUT_SECS -> validation.timeout-secs
        builder = builder.add_source(
            config::Environment::with_prefix("ATLAS")
                .prefix_separator("_")
                .separator("__")
                .convert_case(Case::Kebab),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| AtlasError::InvalidArgument {
                message: format!("failed to load config: {e}"),
            })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(
            self.validation
                .timeout_secs
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
        )
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs.unwrap_or(300))
    }

    pub fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            format: self.validation.format.clone(),
            lint: self.validation.lint.clone(),
            test: self.validation.test.clone(),
            pre_commit: self.validation.pre_commit.clone(),
            timeout: self.command_timeout(),
            live_output: self.validation.live_output.unwrap_or(false),
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            completed: chrono::Duration::days(self.cleanup.completed_days),
            failed: chrono::Duration::days(self.cleanup.failed_days),
            abandoned: chrono::Duration::days(self.cleanup.abandoned_days),
        }
    }

    /// Resolve a template by name: built-ins first, then `[templates]`.
    pub fn template(&self, name: &str) -> Result<TaskTemplate, AtlasError> {
        if let Some(template) = TaskTemplate::builtin(name) {
            return Ok(template);
        }
        let Some(steps) = self.templates.get(name) else {
            return Err(AtlasError::InvalidArgument {
                message: format!("unknown template '{name}'"),
            });
        };
        let mut resolved = Vec::with_capacity(steps.len());
        for (step_name, kind) in steps {
            let kind = kind
                .parse::<StepKind>()
                .map_err(|_| AtlasError::InvalidArgument {
                    message: format!(
                        "template '{name}': step '{step_name}' has unknown kind '{kind}'"
                    ),
                })?;
            resolved.push((step_name.clone(), kind));
        }
        if resolved.is_empty() {
            return Err(AtlasError::InvalidArgument {
                message: format!("template '{name}' has no steps"),
            });
        }
        Ok(TaskTemplate {
            name: name.to_string(),
            steps: resolved,
        })
    }
}
