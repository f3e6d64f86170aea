use super::ProcessDefinition;
use anyhow::Result;

/// Parse a YAML string into a ProcessDefinition.
///
/// Validation is NOT performed here — `compile()` validates before the
/// definition reaches the engine.
pub fn parse_definition_yaml(yaml_str: &str) -> Result<ProcessDefinition> {
    let definition: ProcessDefinition = serde_yaml::from_str(yaml_str)?;
    Ok(definition)
}
