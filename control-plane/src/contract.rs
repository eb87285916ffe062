//! Job contract loading and validation.
//!
//! The contract is written once by the Planner and never touched again.
//! Loading is fail-fast: any violation returns a [`ContractError`] before
//! the reconciler writes anything anywhere.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_types::SCHEMA_VERSION;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Primary media file; must exist and be non-empty.
    Media,
    /// JSON result metadata; must parse and carry the job identity.
    Metadata,
    /// Caption track; must be non-empty UTF-8 text.
    Captions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OutputSpec {
    pub path: String,
    pub kind: ArtifactKind,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl OutputSpec {
    fn new(path: &str, kind: ArtifactKind, required: bool) -> Self {
        Self {
            path: path.to_string(),
            kind,
            required,
        }
    }
}

/// Outputs expected when the contract does not list its own.
pub fn default_outputs() -> Vec<OutputSpec> {
    vec![
        OutputSpec::new("final.mp4", ArtifactKind::Media, true),
        OutputSpec::new("result.json", ArtifactKind::Metadata, true),
        OutputSpec::new("captions.srt", ArtifactKind::Captions, false),
    ]
}

/// Schema v1 job contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobContract {
    pub schema_version: u32,
    /// Advisory only. The filename stem is the canonical identity.
    #[serde(default)]
    pub job_id: Option<String>,
    pub recipe: String,
    #[serde(default)]
    pub fallback_recipes: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub outputs: Option<Vec<OutputSpec>>,
    /// Opaque to the control plane; the Worker reads it from the contract file.
    #[serde(default)]
    pub params: Option<serde_json::Map<String, Value>>,
}

impl JobContract {
    pub fn recipe_count(&self) -> usize {
        1 + self.fallback_recipes.len()
    }

    /// Recipe at `index` in `[recipe] ++ fallback_recipes`, clamped to the last one.
    pub fn recipe_at(&self, index: usize) -> &str {
        if index == 0 {
            return &self.recipe;
        }
        self.fallback_recipes
            .get(index - 1)
            .or_else(|| self.fallback_recipes.last())
            .map(String::as_str)
            .unwrap_or(&self.recipe)
    }

    pub fn has_recipe_after(&self, index: usize) -> bool {
        index + 1 < self.recipe_count()
    }

    pub fn expected_outputs(&self) -> Vec<OutputSpec> {
        self.outputs.clone().unwrap_or_else(default_outputs)
    }
}

/// A validated contract plus its canonical identity.
#[derive(Debug, Clone)]
pub struct LoadedContract {
    pub job_id: String,
    pub path: PathBuf,
    pub contract: JobContract,
    /// The embedded `job_id` when it disagrees with the filename.
    pub identity_mismatch: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("contract unreadable at {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("contract {path} is malformed: {detail}")]
    Malformed { path: PathBuf, detail: String },
    #[error("cannot derive job identity from {path}: {detail}")]
    InvalidIdentity { path: PathBuf, detail: String },
    #[error("contract {path} has unsupported schema_version {found} (expected {expected})")]
    UnsupportedSchema {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error("contract {path} failed validation: {detail}")]
    Invalid { path: PathBuf, detail: String },
}

/// Canonical job identity: the file name up to its first `.`.
pub fn derive_job_id(path: &Path) -> Result<String, ContractError> {
    let invalid = |detail: &str| ContractError::InvalidIdentity {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| invalid("file name is missing or not UTF-8"))?;
    let stem = file_name.split('.').next().unwrap_or_default();
    if stem.is_empty() {
        return Err(invalid("file name has an empty stem"));
    }
    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid(
            "stem may only contain ASCII letters, digits, '-' and '_'",
        ));
    }
    Ok(stem.to_string())
}

pub async fn load_contract(path: &Path) -> Result<LoadedContract, ContractError> {
    let job_id = derive_job_id(path)?;
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ContractError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
    parse_contract(path, &job_id, &raw)
}

pub fn parse_contract(
    path: &Path,
    job_id: &str,
    raw: &str,
) -> Result<LoadedContract, ContractError> {
    let contract: JobContract =
        serde_json::from_str(raw).map_err(|e| ContractError::Malformed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;

    if contract.schema_version != SCHEMA_VERSION {
        return Err(ContractError::UnsupportedSchema {
            path: path.to_path_buf(),
            found: contract.schema_version,
            expected: SCHEMA_VERSION,
        });
    }
    validate(&contract).map_err(|detail| ContractError::Invalid {
        path: path.to_path_buf(),
        detail,
    })?;

    let identity_mismatch = contract
        .job_id
        .as_deref()
        .filter(|embedded| *embedded != job_id)
        .map(ToString::to_string);
    if let Some(embedded) = &identity_mismatch {
        tracing::warn!(
            path = %path.display(),
            job_id = %job_id,
            embedded_job_id = %embedded,
            "Contract body carries a different job_id; using filename-derived identity"
        );
    }

    Ok(LoadedContract {
        job_id: job_id.to_string(),
        path: path.to_path_buf(),
        contract,
        identity_mismatch,
    })
}

fn validate(contract: &JobContract) -> Result<(), String> {
    if contract.recipe.trim().is_empty() {
        return Err("recipe must be a non-empty string".to_string());
    }

    let mut seen = HashSet::new();
    seen.insert(contract.recipe.as_str());
    for fallback in &contract.fallback_recipes {
        if fallback.trim().is_empty() {
            return Err("fallback_recipes may not contain empty names".to_string());
        }
        if !seen.insert(fallback.as_str()) {
            return Err(format!("recipe '{fallback}' is listed more than once"));
        }
    }

    if let Some(outputs) = &contract.outputs {
        if outputs.is_empty() {
            return Err("outputs, when given, must list at least one artifact".to_string());
        }
        if !outputs.iter().any(|o| o.required) {
            return Err("outputs must contain at least one required artifact".to_string());
        }
        let mut paths = HashSet::new();
        for output in outputs {
            validate_output_path(&output.path)?;
            if !paths.insert(output.path.as_str()) {
                return Err(format!("output '{}' is listed more than once", output.path));
            }
        }
    }

    Ok(())
}

fn validate_output_path(raw: &str) -> Result<(), String> {
    if raw.trim().is_empty() {
        return Err("output path must be non-empty".to_string());
    }
    let path = Path::new(raw);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(format!(
            "output path '{raw}' must be relative and stay inside the output directory"
        ));
    }
    Ok(())
}
