//! JSON Schema validation for registry documents.
//!
//! Registry YAML is checked against `schema/registry.schema.json` before it
//! is decoded into typed values, so structural mistakes are reported with the
//! offending instance path instead of a serde error.

use std::sync::OnceLock;
use thiserror::Error;

/// Embedded registry schema (loaded at compile time).
const REGISTRY_SCHEMA_JSON: &str = include_str!("../../schema/registry.schema.json");

/// Compiled JSON Schema validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

/// Errors from schema loading.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to load schema: {0}")]
    LoadError(String),
}

fn get_validator() -> Result<&'static jsonschema::Validator, SchemaError> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = serde_json::from_str(REGISTRY_SCHEMA_JSON)
            .map_err(|e| format!("Invalid schema JSON: {}", e))?;
        jsonschema::options()
            .build(&schema_value)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });

    result
        .as_ref()
        .map_err(|e| SchemaError::LoadError(e.clone()))
}

/// Validate a registry document.
///
/// Returns every violation as `<message> at <instance path>`.
pub fn validate_registry_document(document: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e.to_string()])?;

    let errors: Vec<String> = validator
        .iter_errors(document)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// The raw embedded schema, for tooling that wants to publish it.
pub fn registry_schema_json() -> &'static str {
    REGISTRY_SCHEMA_JSON
}
