//! Configuration module - Modular configuration management
//!
//! - types/mod.rs: Core configuration types (Config, ListenerConfig, LogConfig)
//! - types/sandbox.rs: Template, idle tiers and settle timing
//! - types/runtime.rs: Runtime backend configuration
//! - io.rs: Configuration loading and saving
//! - validation.rs: Configuration validation
//! - paths.rs: Configuration file paths

mod io;
mod paths;
mod types;
mod validation;

// Re-export core config types
pub use types::{Config, ListenerConfig, LogConfig, LogFormat};

// Re-export sandbox types
pub use types::sandbox::{IdleThresholds, SandboxConfig, SettlePolicy};

// Re-export runtime types
pub use types::runtime::DockerConfig;

// Re-export IO and utilities
pub use io::{apply_env_overrides, load_config, load_config_from_path, save_config};
pub use paths::{config_dir, config_path};
pub use validation::{validate_config, ConfigValidationResult, ValidationIssue};
