use std::path::Path;

use anyhow::{Context, Result};

use seqpipe_engine::config::parser;
use seqpipe_engine::{build_registry, StepRegistry};
use seqpipe_types::capability::Capability;

/// Execute the `steps` command: list registered providers by capability.
pub fn execute(job_path: Option<&Path>, json: bool) -> Result<()> {
    let registry = match job_path {
        Some(path) => {
            let config = parser::parse_job(path)
                .with_context(|| format!("Failed to parse job: {}", path.display()))?;
            build_registry(&config)?
        }
        None => StepRegistry::with_default_step_types(),
    };

    if json {
        let listing: Vec<serde_json::Value> = Capability::CONCRETE
            .iter()
            .map(|capability| {
                let providers: Vec<serde_json::Value> = registry
                    .get_providers(*capability)
                    .iter()
                    .map(|p| {
                        serde_json::json!({
                            "name": p.name(),
                            "label": p.label(),
                            "description": p.description(),
                            "parameters": p.parameter_schema(),
                        })
                    })
                    .collect();
                serde_json::json!({
                    "capability": capability.as_str(),
                    "parameter": registry.param_name(*capability),
                    "providers": providers,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if registry.get_providers(Capability::Any).is_empty() {
        println!("No step providers registered.");
    }
    for capability in Capability::CONCRETE {
        let providers = registry.get_providers(capability);
        let param = registry.param_name(capability).unwrap_or("-");
        println!("{capability} (param: {param})");
        if providers.is_empty() {
            println!("  (none)");
        }
        for provider in providers {
            match provider.description() {
                Some(description) => println!("  {:20} {} - {description}", provider.name(), provider.label()),
                None => println!("  {:20} {}", provider.name(), provider.label()),
            }
        }
    }
    Ok(())
}
