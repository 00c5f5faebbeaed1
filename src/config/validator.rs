//! Configuration validation for stack specs.
//!
//! This module validates a parsed configuration before any graph is built,
//! so that naming and wiring mistakes are reported with their field path.

use crate::error::{ConfigError, Result, StackplanError};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{
    ExecutionConfig, GuardrailsConfig, ProjectConfig, ProviderConfig, ProviderKind, StackConfig,
    StateBackend, StateConfig, UnitConfig,
};

/// Fan-out above which a warning is emitted.
const MAX_REASONABLE_PARALLEL: usize = 64;

/// Validator for stack configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            Err(StackplanError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        } else {
            debug!("Configuration validation passed");
            Ok(result)
        }
    }

    /// Runs every check and collects all errors and warnings.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_execution(&config.execution, &mut result);
        if let Some(guardrails) = &config.guardrails {
            Self::validate_guardrails(guardrails, &mut result);
        }
        Self::validate_units(&config.units, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_deref().is_none_or(str::is_empty) {
                    result.error("state.bucket", "S3 bucket name is required when using S3 backend");
                }
            }
            StateBackend::Local => {
                if state.path.as_deref().is_some_and(str::is_empty) {
                    result.error("state.path", "Local state path cannot be empty");
                }
            }
        }
    }

    /// Validates provider configuration.
    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        if provider.kind == ProviderKind::Http {
            match provider.endpoint.as_deref() {
                None | Some("") => {
                    result.error("provider.endpoint", "Endpoint is required for the http provider");
                }
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    result.error(
                        "provider.endpoint",
                        format!("Endpoint '{url}' must start with http:// or https://"),
                    );
                }
                Some(_) => {}
            }
        }

        if provider.timeout_secs == 0 {
            result.error("provider.timeout_secs", "Timeout must be at least 1 second");
        }
    }

    /// Validates execution tuning.
    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.max_parallel == 0 {
            result.error("execution.max_parallel", "max_parallel must be at least 1");
        } else if execution.max_parallel > MAX_REASONABLE_PARALLEL {
            result.warnings.push(format!(
                "execution.max_parallel is {}; providers usually throttle well below that",
                execution.max_parallel
            ));
        }

        if execution.max_attempts == 0 {
            result.error("execution.max_attempts", "max_attempts must be at least 1");
        }

        if execution.base_delay_ms > execution.max_delay_ms {
            result.error(
                "execution.base_delay_ms",
                format!(
                    "base_delay_ms ({}) cannot exceed max_delay_ms ({})",
                    execution.base_delay_ms, execution.max_delay_ms
                ),
            );
        }
    }

    /// Validates guardrails.
    fn validate_guardrails(guardrails: &GuardrailsConfig, result: &mut ValidationResult) {
        if guardrails.max_deletes == Some(0) {
            result
                .warnings
                .push(String::from("guardrails.max_deletes is 0; every plan with a deletion will be blocked"));
        }
    }

    /// Validates all units and their wiring.
    fn validate_units(units: &[UnitConfig], result: &mut ValidationResult) {
        if units.is_empty() {
            result.warnings.push(String::from("No units defined in configuration"));
            return;
        }

        let mut seen_names = HashSet::new();
        for (i, unit) in units.iter().enumerate() {
            let prefix = format!("units[{i}]");

            if !seen_names.insert(unit.name.as_str()) {
                result.error(format!("{prefix}.name"), format!("Duplicate unit name: {}", unit.name));
            }
            if !is_valid_name(&unit.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Unit name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        unit.name
                    ),
                );
            }

            Self::validate_resources(unit, &prefix, result);
            Self::validate_wiring(unit, units, &prefix, result);
        }
    }

    /// Validates the resources of one unit.
    fn validate_resources(unit: &UnitConfig, prefix: &str, result: &mut ValidationResult) {
        if unit.resources.is_empty() {
            result.warnings.push(format!("Unit '{}' has no resources", unit.name));
            return;
        }

        let ids: HashSet<&str> = unit.resources.iter().map(|r| r.id.as_str()).collect();
        let mut seen_ids = HashSet::new();

        for (j, resource) in unit.resources.iter().enumerate() {
            let field = format!("{prefix}.resources[{j}]");

            if !seen_ids.insert(resource.id.as_str()) {
                result.error(
                    format!("{field}.id"),
                    format!("Duplicate resource id '{}' in unit '{}'", resource.id, unit.name),
                );
            }
            if !is_valid_id(&resource.id) {
                result.error(
                    format!("{field}.id"),
                    format!(
                        "Resource id '{}' is invalid. Must be lowercase alphanumeric with '-' or '_'.",
                        resource.id
                    ),
                );
            }

            if !resource.kind.is_known() {
                result.warnings.push(format!(
                    "Resource '{}' has custom kind '{}'; only replace_on forces replacement",
                    resource.id, resource.kind
                ));
            }

            for dep in &resource.depends_on {
                if !ids.contains(dep.as_str()) {
                    result.error(
                        format!("{field}.depends_on"),
                        format!("Resource '{}' depends on unknown resource '{dep}'", resource.id),
                    );
                }
            }

            for (name, value) in &resource.attributes {
                for reference in value.references() {
                    if !ids.contains(reference.node.as_str()) {
                        result.error(
                            format!("{field}.attributes.{name}"),
                            format!("Reference '{reference}' names an unknown resource"),
                        );
                    }
                }
                for input in value.inputs() {
                    if !unit.inputs.contains_key(input) {
                        result.error(
                            format!("{field}.attributes.{name}"),
                            format!("Input '{input}' is not declared by unit '{}'", unit.name),
                        );
                    }
                }
            }

            for attribute in &resource.replace_on {
                if !resource.attributes.contains_key(attribute) {
                    result.warnings.push(format!(
                        "Resource '{}' lists '{attribute}' in replace_on but does not set it",
                        resource.id
                    ));
                }
            }
        }
    }

    /// Validates cross-unit inputs and exports.
    fn validate_wiring(unit: &UnitConfig, units: &[UnitConfig], prefix: &str, result: &mut ValidationResult) {
        for (name, source) in &unit.inputs {
            let field = format!("{prefix}.inputs.{name}");

            if source.unit == unit.name {
                result.error(field, format!("Unit '{}' cannot read its own outputs", unit.name));
                continue;
            }

            match units.iter().find(|u| u.name == source.unit) {
                None => result.error(field, format!("Input '{name}' references unknown unit '{}'", source.unit)),
                Some(upstream) if !upstream.resources.iter().any(|r| r.id == source.node) => {
                    result.error(
                        field,
                        format!("Input '{name}' references unknown resource '{}.{}'", source.unit, source.node),
                    );
                }
                Some(_) => {}
            }
        }

        for (name, export) in &unit.exports {
            if !unit.resources.iter().any(|r| r.id == export.node) {
                result.error(
                    format!("{prefix}.exports.{name}"),
                    format!("Export '{name}' references unknown resource '{}'", export.node),
                );
            }
        }
    }
}

impl ValidationResult {
    /// Records an error.
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if no errors were found.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks if a name is valid (lowercase alphanumeric with hyphens).
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    if !chars.next().is_some_and(|c| c.is_ascii_lowercase()) {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Checks if a resource id is valid (lowercase alphanumeric with `-` or `_`).
fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> StackConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    const VALID: &str = r"
project: { name: n8n }
units:
  - name: network
    exports: { vpc_id: vpc.id }
    resources:
      - id: vpc
        kind: network
  - name: storage
    inputs: { vpc_id: network.vpc.id }
    resources:
      - id: fs
        kind: file-system
        attributes:
          network: { input: vpc_id }
";

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("my-project"));
        assert!(is_valid_name("n8n"));
        assert!(!is_valid_name("My-Project"));
        assert!(!is_valid_name("1project"));
        assert!(!is_valid_name("project-"));
        assert!(!is_valid_name("my--project"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn test_valid_ids() {
        assert!(is_valid_id("task_role"));
        assert!(is_valid_id("nfs-sg"));
        assert!(!is_valid_id("fs.id"));
        assert!(!is_valid_id("_hidden"));
    }

    #[test]
    fn test_valid_config_passes() {
        let result = ConfigValidator::new().validate(&parse(VALID)).unwrap();
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_s3_requires_bucket() {
        let yaml = VALID.replace("project: { name: n8n }", "project: { name: n8n }\nstate: { backend: s3 }");
        let result = ConfigValidator::new().check(&parse(&yaml));
        assert_eq!(result.errors[0].field, "state.bucket");
    }

    #[test]
    fn test_http_provider_requires_endpoint() {
        let yaml = VALID.replace("project: { name: n8n }", "project: { name: n8n }\nprovider: { kind: http }");
        let err = ConfigValidator::new().validate(&parse(&yaml)).unwrap_err();
        assert!(matches!(
            err,
            StackplanError::Config(ConfigError::ValidationError { field: Some(ref f), .. }) if f == "provider.endpoint"
        ));
    }

    #[test]
    fn test_wiring_errors_reported() {
        let yaml = r"
project: { name: n8n }
units:
  - name: storage
    inputs:
      vpc_id: network.vpc.id
      own: storage.fs.id
    exports: { dns: lb.dns_name }
    resources:
      - id: fs
        kind: file-system
        depends_on: [ghost]
        attributes:
          network: { input: subnet_ids }
          sg: { ref: nfs.id }
";
        let result = ConfigValidator::new().check(&parse(yaml));
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"units[0].resources[0].depends_on"));
        assert!(fields.contains(&"units[0].resources[0].attributes.network"));
        assert!(fields.contains(&"units[0].resources[0].attributes.sg"));
        assert!(fields.contains(&"units[0].inputs.vpc_id"));
        assert!(fields.contains(&"units[0].inputs.own"));
        assert!(fields.contains(&"units[0].exports.dns"));
    }

    #[test]
    fn test_execution_bounds() {
        let yaml = VALID.replace(
            "project: { name: n8n }",
            "project: { name: n8n }\nexecution: { max_parallel: 0, base_delay_ms: 10, max_delay_ms: 1 }",
        );
        let result = ConfigValidator::new().check(&parse(&yaml));
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_custom_kind_warns() {
        let yaml = VALID.replace("kind: network", "kind: dns-zone");
        let result = ConfigValidator::new().validate(&parse(&yaml)).unwrap();
        assert_eq!(result.warnings.len(), 1);
    }
}
