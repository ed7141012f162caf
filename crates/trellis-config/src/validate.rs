use crate::config::Config;
use crate::error::ConfigError;

fn violation(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        message: message.into(),
    }
}

/// Validate a [`Config`], returning all detected violations.
///
/// Returns `Ok(())` when the config is valid, or `Err` with a
/// vector of every validation error found.
pub fn validate(config: &Config) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    if config.adapter.adapter_id.trim().is_empty() {
        errors.push(violation("adapter.adapter_id", "must not be empty"));
    }

    // exactly one way to reach the adapter
    match (&config.adapter.command, config.adapter.port) {
        (Some(_), Some(_)) => errors.push(violation(
            "adapter",
            "set either command or port, not both",
        )),
        (None, None) => errors.push(violation("adapter", "set either command or port")),
        (Some(command), None) if command.trim().is_empty() => {
            errors.push(violation("adapter.command", "must not be empty"));
        }
        (None, Some(0)) => errors.push(violation("adapter.port", "must not be 0")),
        _ => {}
    }

    let timeouts = [
        ("session.request_timeout_secs", config.session.request_timeout_secs),
        (
            "session.initialize_timeout_secs",
            config.session.initialize_timeout_secs,
        ),
        (
            "session.disconnect_timeout_secs",
            config.session.disconnect_timeout_secs,
        ),
    ];
    for (field, secs) in timeouts {
        if secs == 0 {
            errors.push(violation(field, "must be greater than 0"));
        }
    }

    for (i, bp) in config.breakpoints.iter().enumerate() {
        if bp.line < 1 {
            errors.push(violation(
                format!("breakpoints[{i}].line"),
                format!("must be at least 1, got {}", bp.line),
            ));
        }
        match (&bp.url, &bp.path) {
            (None, None) => errors.push(violation(
                format!("breakpoints[{i}]"),
                "needs a url or a path",
            )),
            (Some(_), Some(_)) => errors.push(violation(
                format!("breakpoints[{i}]"),
                "set either url or path, not both",
            )),
            _ => {}
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
