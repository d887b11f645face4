//! Playbook Parser
//!
//! Handles loading playbook definitions from their serialized YAML form
//! (JSON documents are accepted as well) and running pre-start validation.

use std::error::Error;
use std::fs;

use log::{debug, info};
use thiserror::Error;

use super::model::Definition;
use super::validator::{validate_definition, ValidationError};

/// Why a serialized definition could not be loaded.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Failed to parse playbook definition: {0}")]
    Parse(String),

    #[error("Playbook definition is invalid:\n{}", format_errors(.0))]
    Invalid(Vec<ValidationError>),
}

impl DefinitionError {
    /// Validation errors carried by this error, if any.
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            Self::Invalid(errors) => errors,
            Self::Parse(_) => &[],
        }
    }
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deserializes and validates a definition.
///
/// A definition is returned only when validation produced no errors.
///
/// # Example
///
/// ```
/// use playrunner::workflow::load_definition;
///
/// let definition = load_definition(
///     "start_sequence: main\nsequences:\n  main:\n    - id: hello\n",
/// )
/// .unwrap();
/// assert_eq!(definition.action_count(), 1);
/// ```
pub fn load_definition(serialized: &str) -> Result<Definition, DefinitionError> {
    debug!("Definition content loaded ({} bytes)", serialized.len());

    let definition: Definition =
        serde_yaml::from_str(serialized).map_err(|e| DefinitionError::Parse(e.to_string()))?;

    let errors = validate_definition(&definition);
    if !errors.is_empty() {
        return Err(DefinitionError::Invalid(errors));
    }

    info!(
        "Loaded definition: {} sequences, {} actions, starting at '{}'",
        definition.sequences.len(),
        definition.action_count(),
        definition.start_sequence
    );

    Ok(definition)
}

/// Reads a playbook file and returns its serialized text after checking
/// that it loads.
pub fn read_definition_file(path: &str) -> Result<(String, Definition), Box<dyn Error>> {
    info!("Loading playbook from: {}", path);

    let content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read playbook file '{}': {}. Check that the file exists and is readable.",
            path, e
        )
    })?;

    let definition = load_definition(&content)?;
    Ok((content, definition))
}

/// Loads a definition from a YAML file.
pub fn load_definition_file(path: &str) -> Result<Definition, Box<dyn Error>> {
    read_definition_file(path).map(|(_, definition)| definition)
}

/// Serializes a definition to its canonical YAML form.
pub fn serialize_definition(definition: &Definition) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(definition)
}

/// Saves a definition to a YAML file.
pub fn save_definition(definition: &Definition, path: &str) -> Result<(), Box<dyn Error>> {
    let yaml_content = serialize_definition(definition)?;
    fs::write(path, yaml_content)?;
    info!("Definition saved to: {}", path);
    Ok(())
}
