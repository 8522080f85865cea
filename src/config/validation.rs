//! Configuration validation
//!
//! Validates configuration and reports issues.

use std::time::Duration;

use super::types::Config;

/// Result of configuration validation
#[derive(Debug, Clone)]
pub struct ConfigValidationResult {
    /// Whether the config is valid
    pub valid: bool,
    /// Validation errors (critical)
    pub errors: Vec<ValidationIssue>,
    /// Validation warnings (non-critical)
    pub warnings: Vec<ValidationIssue>,
}

impl ConfigValidationResult {
    /// Create a valid result
    pub fn valid() -> Self {
        ConfigValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.valid = false;
        self.errors.push(issue);
        self
    }

    /// Add a warning
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }
}

/// A validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the config field
    pub path: String,
    /// Issue message
    pub message: String,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Create a new issue
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Add a suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(ref suggestion) = self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

/// Validate the configuration
pub fn validate_config(config: &Config) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::valid();

    result = validate_sandbox_config(config, result);
    result = validate_idle_config(config, result);
    result = validate_listener_config(config, result);

    result
}

fn validate_sandbox_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.sandbox.template.trim().is_empty() {
        result = result.with_error(
            ValidationIssue::new("sandbox.template", "No template configured")
                .with_suggestion("Set sandbox.template or HONEYPOOL_TEMPLATE"),
        );
    }

    if config.sandbox.name_prefix.trim().is_empty() {
        result = result.with_error(ValidationIssue::new(
            "sandbox.name_prefix",
            "Sandbox names need a non-empty prefix",
        ));
    }

    if config.sandbox.settle.address_retries == 0 {
        result = result.with_warning(ValidationIssue::new(
            "sandbox.settle.address_retries",
            "Address lookups are not retried; freshly started sandboxes will rarely settle",
        ));
    }

    if config.sandbox.settle.dial_retries == 0 {
        result = result.with_warning(ValidationIssue::new(
            "sandbox.settle.dial_retries",
            "Connections into sandboxes are not retried",
        ));
    }

    if config.sandbox.settle.connect_timeout.is_zero() {
        result = result.with_error(
            ValidationIssue::new(
                "sandbox.settle.connect_timeout",
                "Every connection attempt would time out immediately",
            )
            .with_suggestion("Use a timeout such as \"1s\""),
        );
    }

    result
}

fn validate_idle_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let idle = &config.sandbox.idle;

    if idle.stop_after < idle.freeze_after {
        result = result.with_error(
            ValidationIssue::new(
                "sandbox.idle.stop_after",
                "stop_after is shorter than freeze_after; sandboxes are only stopped once frozen",
            )
            .with_suggestion("Raise stop_after to at least freeze_after"),
        );
    }

    if idle.poll_interval.is_zero() {
        result = result.with_error(ValidationIssue::new(
            "sandbox.idle.poll_interval",
            "poll_interval must be greater than zero",
        ));
    } else if idle.poll_interval > idle.freeze_after {
        result = result.with_warning(ValidationIssue::new(
            "sandbox.idle.poll_interval",
            "poll_interval exceeds freeze_after; freezing will lag behind the threshold",
        ));
    }

    if idle.freeze_after < Duration::from_secs(10) {
        result = result.with_warning(ValidationIssue::new(
            "sandbox.idle.freeze_after",
            "Very short freeze_after; sandboxes will be frozen between attacker keystrokes",
        ));
    }

    result
}

fn validate_listener_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.listener.addresses.is_empty() {
        result = result.with_error(
            ValidationIssue::new("listener.addresses", "No listen address configured")
                .with_suggestion("Set listener.addresses or HONEYPOOL_LISTEN"),
        );
    }

    for addr in &config.listener.addresses {
        if addr.parse::<std::net::SocketAddr>().is_err() {
            result = result.with_error(ValidationIssue::new(
                "listener.addresses",
                format!("Invalid socket address: {}", addr),
            ));
        }
    }

    result
}
