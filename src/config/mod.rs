//! Configuration module for stackplan.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `stackplan.yaml`
//! - Validation of configuration values and cross-unit wiring
//! - Computing configuration hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, PROVIDER_TOKEN_VAR, find_config_file};
pub use spec::{
    ExecutionConfig, GuardrailsConfig, ProjectConfig, ProviderConfig, ProviderKind, ResourceConfig,
    StackConfig, StateBackend, StateConfig, UnitConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
