use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::ConfigError;
use crate::merge::merge_configs;
use crate::validate::validate;

/// Content written into a newly-created default config file.
const DEFAULT_CONFIG_CONTENT: &str = r#"# Trellis debugger configuration
# Uncomment and edit settings below to override defaults.

# [adapter]
# adapter_id = "node"
# command = "js-debug-adapter"
# args = []
# host = "127.0.0.1"
# port = 4711

# [session]
# request_timeout_secs = 10
# initialize_timeout_secs = 30
# disconnect_timeout_secs = 5
# delay_launch = false
# terminate_debuggee = true

# [launch]
# request = "launch"
#
# [launch.arguments]
# program = "app.js"

# [[breakpoints]]
# path = "src/app.js"
# line = 12
# condition = "count > 3"

# [log]
# level = "info"
"#;

const GLOBAL_FILE: &str = "debug.toml";
const PROJECT_DIR: &str = ".trellis";

/// Load and merge configuration.
///
/// 1. Reads the global config from `config_dir/debug.toml`.
///    If the file does not exist it is created with commented-out
///    defaults.
/// 2. Optionally reads a project config from
///    `project_dir/.trellis/debug.toml` (walks upward).
/// 3. Merges: `Config::default() <- global <- project`.
/// 4. Validates the merged result.
///
/// # Errors
///
/// Returns [`ConfigError`] on I/O failure, parse failure, or
/// validation failure.
pub fn load_config(config_dir: &Path, project_dir: Option<&Path>) -> Result<Config, ConfigError> {
    let global_path = config_dir.join(GLOBAL_FILE);

    // Ensure config dir exists
    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir)?;
    }

    // Create default config if missing
    if !global_path.exists() {
        std::fs::write(&global_path, DEFAULT_CONFIG_CONTENT)
            .map_err(|e| ConfigError::CreateDefault(e.to_string()))?;
        tracing::info!("Created default config at {}", global_path.display());
    }

    let config = merge_file(Config::default(), &global_path)?;
    let config = merge_project(config, project_dir)?;
    first_violation(&config)?;
    Ok(config)
}

/// Load an explicitly named config file, then merge the project config
/// on top of it.
///
/// # Errors
///
/// Returns [`ConfigError::NotFound`] when `path` does not exist, and
/// otherwise the same errors as [`load_config`].
pub fn load_file(path: &Path, project_dir: Option<&Path>) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let config = merge_file(Config::default(), path)?;
    let config = merge_project(config, project_dir)?;
    first_violation(&config)?;
    Ok(config)
}

fn merge_file(config: Config, path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    if !has_non_comment_content(&content) {
        return Ok(config);
    }
    tracing::debug!("Merging config from {}", path.display());
    merge_configs(&config, &content).map_err(|e| match e {
        ConfigError::Parse(msg) => ConfigError::Parse(format!("{}: {msg}", path.display())),
        other => other,
    })
}

fn merge_project(config: Config, project_dir: Option<&Path>) -> Result<Config, ConfigError> {
    match project_dir.and_then(find_project_config) {
        Some(project_path) => merge_file(config, &project_path),
        None => Ok(config),
    }
}

fn first_violation(config: &Config) -> Result<(), ConfigError> {
    validate(config).map_err(|errors| {
        errors
            .into_iter()
            .next()
            .unwrap_or_else(|| ConfigError::Validation {
                field: "unknown".to_string(),
                message: "validation failed".to_string(),
            })
    })
}

/// Walk from `start` upward looking for `.trellis/debug.toml`.
fn find_project_config(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(PROJECT_DIR).join(GLOBAL_FILE);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Returns `true` when the content has at least one
/// non-empty, non-comment line.
fn has_non_comment_content(content: &str) -> bool {
    content.lines().any(|l| {
        let trimmed = l.trim();
        !trimmed.is_empty() && !trimmed.starts_with('#')
    })
}

/// Parse a TOML string directly into a validated [`Config`].
///
/// Useful for tests or one-off parsing without file I/O.
///
/// # Errors
///
/// Returns [`ConfigError`] on parse or validation failure.
pub fn load_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    first_violation(&config)?;
    Ok(config)
}
