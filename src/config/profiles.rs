// src/config/profiles.rs: invocation profiles for the external tools

use std::collections::HashMap;
use std::path::Path;
use serde::{Deserialize, Serialize};
use crate::config::defs::{PipelineError, PipelineVariant};
use crate::utils::command::{TemplateVars, ToolTemplate};


/// Tool chain of one stage under one variant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageProfile {
    /// Commands in pipe order; each stdout feeds the next stdin.
    pub commands: Vec<ToolTemplate>,
    /// File (relative to the stage directory) receiving the last command's stdout.
    #[serde(default)]
    pub stdout_artifact: Option<String>,
    /// Further files the tools write themselves.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl StageProfile {
    /// All declared artifacts, the stdout artifact first.
    pub fn declared_artifacts(&self) -> Vec<&str> {
        self.stdout_artifact
            .iter()
            .map(String::as_str)
            .chain(self.artifacts.iter().map(String::as_str))
            .collect()
    }

    /// Declared artifacts with their placeholders filled in.
    pub fn expand_artifacts(&self, vars: &TemplateVars) -> Result<Vec<String>, PipelineError> {
        self.declared_artifacts()
            .into_iter()
            .map(|a| {
                let name = vars.expand(a)?;
                if name.is_empty() || Path::new(&name).is_absolute() || name.split('/').any(|c| c == "..") {
                    return Err(PipelineError::InvalidConfig(format!(
                        "Artifact '{}' must be a relative path inside the stage directory",
                        name
                    )));
                }
                Ok(name)
            })
            .collect()
    }
}


#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VariantProfile {
    /// Extra placeholders such as `reference` or `license`.
    #[serde(default)]
    pub resources: HashMap<String, String>,
    pub alignment: StageProfile,
    pub calling: StageProfile,
}


/// Profiles of every variant, loaded from `--profiles`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProfileSet {
    profiles: HashMap<PipelineVariant, VariantProfile>,
}

impl ProfileSet {
    pub fn from_json(text: &str) -> Result<Self, PipelineError> {
        let profiles: HashMap<PipelineVariant, VariantProfile> = serde_json::from_str(text)
            .map_err(|e| PipelineError::InvalidConfig(format!("Invalid profile JSON: {}", e)))?;
        let set = Self { profiles };
        set.validate()?;
        Ok(set)
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::InvalidConfig(format!("Cannot read profiles {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn insert(&mut self, variant: PipelineVariant, profile: VariantProfile) {
        self.profiles.insert(variant, profile);
    }

    pub fn get(&self, variant: PipelineVariant) -> Result<&VariantProfile, PipelineError> {
        self.profiles
            .get(&variant)
            .ok_or_else(|| PipelineError::InvalidConfig(format!("No invocation profile for variant {}", variant)))
    }

    /// Programs named by any profile, for the version pre-flight.
    pub fn programs(&self) -> Vec<String> {
        let mut programs: Vec<String> = self
            .profiles
            .values()
            .flat_map(|p| p.alignment.commands.iter().chain(p.calling.commands.iter()))
            .map(|t| t.program.clone())
            .collect();
        programs.sort();
        programs.dedup();
        programs
    }

    fn validate(&self) -> Result<(), PipelineError> {
        for (variant, profile) in &self.profiles {
            for (stage, stage_profile) in [("alignment", &profile.alignment), ("calling", &profile.calling)] {
                if stage_profile.commands.is_empty() {
                    return Err(PipelineError::InvalidConfig(format!(
                        "Profile {} has no {} commands",
                        variant, stage
                    )));
                }
            }
        }
        Ok(())
    }
}
