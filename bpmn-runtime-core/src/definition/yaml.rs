use super::model::ProcessModel;
use anyhow::{Context, Result};

/// Parse a YAML string into a ProcessModel.
///
/// Validation is NOT performed here; deployment validates before compiling.
pub fn parse_process_yaml(yaml_str: &str) -> Result<ProcessModel> {
    serde_yaml::from_str(yaml_str).context("Parsing process YAML")
}
