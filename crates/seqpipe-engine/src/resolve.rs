//! Step list resolution, per-step schema validation and status backend
//! creation.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use seqpipe_state::{JobStatusBackend, SqliteStatusBackend};
use seqpipe_types::capability::Capability;

use crate::config::types::{JobConfig, StateBackendKind};
use crate::error::PipelineError;
use crate::registry::{JobParams, StepDef, StepProvider, StepRegistry};

/// Every configured step, grouped by capability in pipeline order.
#[derive(Debug, Default)]
pub struct ResolvedSteps {
    pub groups: Vec<(Capability, Vec<StepDef>)>,
}

impl ResolvedSteps {
    #[must_use]
    pub fn total(&self) -> usize {
        self.groups.iter().map(|(_, steps)| steps.len()).sum()
    }
}

/// Resolve the step list of every bound capability.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] for the first unknown provider name
/// or an over-configured single-step capability.
pub fn resolve_steps(registry: &StepRegistry, params: &JobParams) -> Result<ResolvedSteps, PipelineError> {
    let mut resolved = ResolvedSteps::default();
    for capability in Capability::CONCRETE {
        if registry.param_name(capability).is_none() {
            continue;
        }
        let steps = if capability == Capability::Alignment {
            registry.get_single_step(params, capability)?.into_iter().collect()
        } else {
            registry.get_steps(params, capability)?
        };
        resolved.groups.push((capability, steps));
    }
    Ok(resolved)
}

/// Check a step's configuration against its provider's declared schema.
pub(crate) fn validate_step_config(provider: &dyn StepProvider, config: &serde_json::Value) -> Result<()> {
    let Some(schema_value) = provider.parameter_schema() else {
        return Ok(());
    };

    let validator = jsonschema::validator_for(schema_value)
        .with_context(|| format!("Invalid JSON Schema for step '{}'", provider.name()))?;

    let instance = if config.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        config.clone()
    };
    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .map(|e| format!("  - {e}"))
        .collect();

    if !errors.is_empty() {
        anyhow::bail!(
            "Configuration validation failed for step '{}':\n{}",
            provider.name(),
            errors.join("\n"),
        );
    }

    tracing::debug!(step = provider.name(), "Step config schema validation passed");
    Ok(())
}

pub(crate) fn create_status_backend(config: &JobConfig) -> Result<Arc<dyn JobStatusBackend>> {
    match config.state.backend {
        StateBackendKind::Sqlite => {
            let backend = if let Some(path) = &config.state.connection {
                SqliteStatusBackend::open(Path::new(path)).context("Failed to open status DB")?
            } else {
                SqliteStatusBackend::in_memory().context("Failed to create in-memory status DB")?
            };
            Ok(Arc::new(backend) as Arc<dyn JobStatusBackend>)
        }
    }
}
