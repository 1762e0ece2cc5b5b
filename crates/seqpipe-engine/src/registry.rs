//! Step provider registry.
//!
//! Providers are registered once at startup into an explicitly constructed
//! [`StepRegistry`] that is then shared read-only (`Arc<StepRegistry>`).
//! Each capability is bound to the job parameter that lists the provider
//! names to run for it, as a `;`-separated ordered list.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use seqpipe_types::capability::Capability;
use tracing::{debug, warn};

use crate::context::JobContext;
use crate::error::PipelineError;
use crate::resolve::validate_step_config;
use crate::step::StepInstance;

/// Flat job parameters.
pub type JobParams = BTreeMap<String, String>;

/// Default capability → job parameter bindings.
pub const DEFAULT_STEP_TYPES: [(Capability, &str); 6] = [
    (Capability::Preprocessing, "fastqProcessing"),
    (Capability::Alignment, "alignment"),
    (Capability::BamProcessing, "bamPostProcessing"),
    (Capability::Assembly, "assembly"),
    (Capability::SingleCellProcessing, "singleCell"),
    (Capability::GenericOutputHandler, "outputHandlers"),
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Pipeline step name cannot be empty")]
    EmptyName,

    #[error("Unable to find pipeline step: [{name}] for capability {capability}")]
    NotFound { name: String, capability: Capability },

    #[error("A {capability} step named '{name}' is already registered")]
    DuplicateName { name: String, capability: Capability },

    #[error("Step type {0} is already bound to a job parameter")]
    DuplicateStepType(Capability),

    #[error("Step type {0} is not bound to a job parameter")]
    UnboundStepType(Capability),

    #[error("Only one {capability} step may be configured, found {count}")]
    MultipleSteps { capability: Capability, count: usize },
}

impl From<RegistryError> for PipelineError {
    fn from(err: RegistryError) -> Self {
        PipelineError::Config(err.to_string())
    }
}

/// Factory and metadata for one kind of step.
pub trait StepProvider: Send + Sync {
    /// Name used in job parameters. Case-sensitive.
    fn name(&self) -> &str;

    /// Human-readable label, used as the action name.
    fn label(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    /// The single capability this provider's steps implement.
    fn capability(&self) -> Capability;

    /// JSON Schema for this provider's per-step configuration.
    fn parameter_schema(&self) -> Option<&serde_json::Value> {
        None
    }

    /// Build a step bound to a running job.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when the step configuration is
    /// unusable.
    fn create(&self, ctx: &StepCtx<'_>) -> Result<StepInstance, PipelineError>;
}

/// Everything a provider sees when creating a step.
pub struct StepCtx<'a> {
    pub def: &'a StepDef,
    /// Configuration for this repetition (`Value::Null` when none).
    pub config: serde_json::Value,
    pub job: &'a JobContext,
}

/// A configured step: one provider plus its zero-based repetition index.
#[derive(Clone)]
pub struct StepDef {
    provider: Arc<dyn StepProvider>,
    index: u32,
}

impl StepDef {
    #[must_use]
    pub fn new(provider: Arc<dyn StepProvider>, index: u32) -> Self {
        Self { provider, index }
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn StepProvider> {
        &self.provider
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.provider.name()
    }

    #[must_use]
    pub fn label(&self) -> &str {
        self.provider.label()
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub fn capability(&self) -> Capability {
        self.provider.capability()
    }

    /// Provider name, suffixed with `-<index>` for repeated instances.
    /// Used to build output file names.
    #[must_use]
    pub fn unique_name(&self) -> String {
        if self.index == 0 {
            self.name().to_string()
        } else {
            format!("{}-{}", self.name(), self.index)
        }
    }

    /// Action label; repeated instances are numbered from 2.
    #[must_use]
    pub fn action_name(&self) -> String {
        if self.index == 0 {
            self.label().to_string()
        } else {
            format!("{} ({})", self.label(), self.index + 1)
        }
    }

    /// Validate this step's configuration and ask the provider for an
    /// instance.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if the configuration fails the
    /// provider's schema or the provider rejects it.
    pub fn create(&self, job: &JobContext) -> Result<StepInstance, PipelineError> {
        let config = job.step_config_for(self.name(), self.index);
        validate_step_config(self.provider.as_ref(), &config).map_err(|e| PipelineError::config(format!("{e:#}")))?;
        let instance = self.provider.create(&StepCtx {
            def: self,
            config,
            job,
        })?;
        if instance.capability() != self.capability() {
            return Err(PipelineError::config(format!(
                "Provider '{}' declared {} but created a {} step",
                self.name(),
                self.capability(),
                instance.capability()
            )));
        }
        debug!(step = self.name(), index = self.index, "Created step");
        Ok(instance)
    }
}

impl fmt::Debug for StepDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDef")
            .field("name", &self.name())
            .field("capability", &self.capability())
            .field("index", &self.index)
            .finish()
    }
}

/// Registry of step providers and capability parameter bindings.
#[derive(Default)]
pub struct StepRegistry {
    providers: Vec<Arc<dyn StepProvider>>,
    step_types: BTreeMap<Capability, String>,
}

impl StepRegistry {
    /// Empty registry with no capability bindings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with [`DEFAULT_STEP_TYPES`] bound.
    #[must_use]
    pub fn with_default_step_types() -> Self {
        let mut registry = Self::new();
        for (capability, param) in DEFAULT_STEP_TYPES {
            registry.step_types.insert(capability, param.to_string());
        }
        registry
    }

    /// Add a provider.
    ///
    /// Registering the same provider instance again is a no-op. A provider
    /// declaring [`Capability::Any`] cannot be resolved and is skipped with a
    /// warning.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateName`] if a different provider with
    /// the same name and capability is already registered.
    pub fn register(&mut self, provider: Arc<dyn StepProvider>) -> Result<(), RegistryError> {
        if self.providers.iter().any(|p| Arc::ptr_eq(p, &provider)) {
            return Ok(());
        }
        let capability = provider.capability();
        if capability == Capability::Any {
            warn!(
                step = provider.name(),
                "Step provider does not declare a concrete capability, skipping"
            );
            return Ok(());
        }
        if self
            .providers
            .iter()
            .any(|p| p.capability() == capability && p.name() == provider.name())
        {
            return Err(RegistryError::DuplicateName {
                name: provider.name().to_string(),
                capability,
            });
        }
        debug!(step = provider.name(), capability = %capability, "Registered step provider");
        self.providers.push(provider);
        Ok(())
    }

    /// Bind a capability to the job parameter listing its steps.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateStepType`] if the capability is
    /// already bound.
    pub fn register_step_type(
        &mut self,
        capability: Capability,
        param_name: impl Into<String>,
    ) -> Result<(), RegistryError> {
        if self.step_types.contains_key(&capability) {
            return Err(RegistryError::DuplicateStepType(capability));
        }
        self.step_types.insert(capability, param_name.into());
        Ok(())
    }

    #[must_use]
    pub fn param_name(&self, capability: Capability) -> Option<&str> {
        self.step_types.get(&capability).map(String::as_str)
    }

    /// Every provider assignable to `capability`, in registration order.
    #[must_use]
    pub fn get_providers(&self, capability: Capability) -> Vec<&Arc<dyn StepProvider>> {
        self.providers
            .iter()
            .filter(|p| capability.is_assignable_from(p.capability()))
            .collect()
    }

    /// Exact, case-sensitive lookup among [`get_providers`](Self::get_providers).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::EmptyName`] for a blank name and
    /// [`RegistryError::NotFound`] when nothing matches.
    pub fn get_provider_by_name(
        &self,
        name: &str,
        capability: Capability,
    ) -> Result<Arc<dyn StepProvider>, RegistryError> {
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        self.get_providers(capability)
            .into_iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
                capability,
            })
    }

    /// Resolve the ordered step list configured for `capability`.
    ///
    /// Each entry's index is the number of earlier entries with the same
    /// name. A missing or blank parameter yields an empty list; blank
    /// entries between separators are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnboundStepType`] if the capability has no
    /// parameter binding, or a lookup error for an unknown name.
    pub fn get_steps(&self, params: &JobParams, capability: Capability) -> Result<Vec<StepDef>, RegistryError> {
        let param = self
            .param_name(capability)
            .ok_or(RegistryError::UnboundStepType(capability))?;
        let Some(raw) = params.get(param).filter(|v| !v.trim().is_empty()) else {
            return Ok(Vec::new());
        };

        let mut seen: BTreeMap<&str, u32> = BTreeMap::new();
        let mut steps = Vec::new();
        for name in raw.split(';').map(str::trim).filter(|n| !n.is_empty()) {
            let provider = self.get_provider_by_name(name, capability)?;
            let count = seen.entry(name).or_insert(0);
            steps.push(StepDef::new(provider, *count));
            *count += 1;
        }
        Ok(steps)
    }

    /// The one step configured for `capability`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::MultipleSteps`] when more than one is
    /// configured, plus any [`get_steps`](Self::get_steps) error.
    pub fn get_single_step(&self, params: &JobParams, capability: Capability) -> Result<Option<StepDef>, RegistryError> {
        let mut steps = self.get_steps(params, capability)?;
        match steps.len() {
            0 => Ok(None),
            1 => Ok(steps.pop()),
            count => Err(RegistryError::MultipleSteps { capability, count }),
        }
    }
}
