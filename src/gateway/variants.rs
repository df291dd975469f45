//! Deployable prompt variants and their lifecycle.
//!
//! Variants form a parent/child chain: every candidate records the
//! variant it mutated, and rolling back a key means re-deploying the
//! current variant's parent. At most one variant is deployed per
//! (model, spectrum) at any instant, enforced by the deployment map.
//!
//! This store is the single place variant status transitions happen; the
//! cycle manager decides, the gateway applies.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::CycleError;
use crate::trace::Spectrum;

/// Retained deployment-history entries.
const HISTORY_CAP: usize = 256;

/// Sampling and budget parameters carried by a variant.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VariantParameters {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for VariantParameters {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1_024,
            top_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantStatus {
    Candidate,
    Deployed,
    Archived,
}

/// A deployable bundle of system prompt plus parameters.
#[derive(Debug, Clone, Serialize)]
pub struct PromptVariant {
    pub variant_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub system_prompt: String,
    pub parameters: VariantParameters,
    pub parent_variant_id: Option<Uuid>,
    pub status: VariantStatus,
}

impl PromptVariant {
    /// A fresh candidate derived from a parent.
    pub fn candidate_from(parent: &PromptVariant) -> Self {
        Self {
            variant_id: Uuid::new_v4(),
            created_at: Utc::now(),
            system_prompt: parent.system_prompt.clone(),
            parameters: parent.parameters,
            parent_variant_id: Some(parent.variant_id),
            status: VariantStatus::Candidate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantAction {
    Deployed,
    Archived,
    RolledBack,
}

/// One entry in the deployment history.
#[derive(Debug, Clone, Serialize)]
pub struct VariantChange {
    pub at: DateTime<Utc>,
    pub model: String,
    pub spectrum: Spectrum,
    pub action: VariantAction,
    pub variant_id: Uuid,
}

/// Baseline instruction per spectrum, the root of every variant chain.
fn default_system_prompt(spectrum: Spectrum) -> String {
    let focus = match spectrum {
        Spectrum::Identity => "Resolve the customer identity precisely before answering.",
        Spectrum::Financial => "Report financial figures exactly as recorded, with units.",
        Spectrum::MultiField => "Answer every requested field; never silently drop one.",
        Spectrum::Context => "Carry conversation context forward across turns.",
        Spectrum::Scaling => "Keep answers correct under batched, high-volume requests.",
        Spectrum::Edge => "Handle missing or malformed data explicitly, never guess.",
        Spectrum::Communication => "Answer in clear, plain language for a non-expert reader.",
    };
    format!("You are a customer data assistant. {focus}")
}

struct VariantState {
    variants: HashMap<Uuid, PromptVariant>,
    deployed: HashMap<(String, Spectrum), Uuid>,
    history: VecDeque<VariantChange>,
}

/// All known variants and the per-key deployment map.
pub struct VariantStore {
    inner: RwLock<VariantState>,
}

impl Default for VariantStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VariantStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(VariantState {
                variants: HashMap::new(),
                deployed: HashMap::new(),
                history: VecDeque::new(),
            }),
        }
    }

    /// The deployed variant for a key, creating and deploying the
    /// baseline on first sight.
    pub fn ensure_deployed(&self, model: &str, spectrum: Spectrum) -> PromptVariant {
        if let Some(existing) = self.deployed_for(model, spectrum) {
            return existing;
        }
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let key = (model.to_string(), spectrum);
        // Re-check under the write lock.
        if let Some(id) = state.deployed.get(&key)
            && let Some(variant) = state.variants.get(id)
        {
            return variant.clone();
        }
        let baseline = PromptVariant {
            variant_id: Uuid::new_v4(),
            created_at: Utc::now(),
            system_prompt: default_system_prompt(spectrum),
            parameters: VariantParameters::default(),
            parent_variant_id: None,
            status: VariantStatus::Deployed,
        };
        state.deployed.insert(key.clone(), baseline.variant_id);
        state.variants.insert(baseline.variant_id, baseline.clone());
        push_history(
            &mut state.history,
            key,
            VariantAction::Deployed,
            baseline.variant_id,
        );
        baseline
    }

    /// Snapshot of the deployed variant for a key.
    pub fn deployed_for(&self, model: &str, spectrum: Spectrum) -> Option<PromptVariant> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let id = state.deployed.get(&(model.to_string(), spectrum))?;
        state.variants.get(id).cloned()
    }

    pub fn get(&self, variant_id: Uuid) -> Option<PromptVariant> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.variants.get(&variant_id).cloned()
    }

    /// Register a new candidate.
    pub fn register_candidate(&self, mut variant: PromptVariant) {
        variant.status = VariantStatus::Candidate;
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state.variants.insert(variant.variant_id, variant);
    }

    /// Deploy a candidate for a key, archiving the previous deployment.
    pub fn promote(
        &self,
        model: &str,
        spectrum: Spectrum,
        variant_id: Uuid,
    ) -> Result<(), CycleError> {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if !state.variants.contains_key(&variant_id) {
            return Err(CycleError::VariantNotFound { variant_id });
        }
        let key = (model.to_string(), spectrum);

        if let Some(old_id) = state.deployed.get(&key).copied() {
            if old_id == variant_id {
                return Ok(());
            }
            if let Some(old) = state.variants.get_mut(&old_id) {
                old.status = VariantStatus::Archived;
            }
            push_history(&mut state.history, key.clone(), VariantAction::Archived, old_id);
        }

        if let Some(variant) = state.variants.get_mut(&variant_id) {
            variant.status = VariantStatus::Deployed;
        }
        state.deployed.insert(key.clone(), variant_id);
        push_history(&mut state.history, key, VariantAction::Deployed, variant_id);
        Ok(())
    }

    /// Archive a variant that lost its experiment.
    pub fn archive(&self, variant_id: Uuid) -> Result<(), CycleError> {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let variant = state
            .variants
            .get_mut(&variant_id)
            .ok_or(CycleError::VariantNotFound { variant_id })?;
        if variant.status == VariantStatus::Deployed {
            return Err(CycleError::Invariant {
                detail: format!("cannot archive deployed variant {variant_id} directly"),
            });
        }
        variant.status = VariantStatus::Archived;
        Ok(())
    }

    /// Re-deploy the parent of the currently deployed variant.
    pub fn rollback(&self, model: &str, spectrum: Spectrum) -> Result<Uuid, CycleError> {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let key = (model.to_string(), spectrum);
        let current_id =
            state
                .deployed
                .get(&key)
                .copied()
                .ok_or_else(|| CycleError::Invariant {
                    detail: format!("no deployment to roll back for {model}/{spectrum}"),
                })?;
        let parent_id = state
            .variants
            .get(&current_id)
            .and_then(|v| v.parent_variant_id)
            .ok_or_else(|| CycleError::Invariant {
                detail: format!("deployed variant {current_id} has no parent"),
            })?;

        if let Some(current) = state.variants.get_mut(&current_id) {
            current.status = VariantStatus::Archived;
        }
        if let Some(parent) = state.variants.get_mut(&parent_id) {
            parent.status = VariantStatus::Deployed;
        }
        state.deployed.insert(key.clone(), parent_id);
        push_history(&mut state.history, key, VariantAction::RolledBack, parent_id);
        Ok(parent_id)
    }

    /// Recent deployment changes, newest first.
    pub fn changes(&self, limit: usize) -> Vec<VariantChange> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.history.iter().rev().take(limit).cloned().collect()
    }
}

fn push_history(
    history: &mut VecDeque<VariantChange>,
    key: (String, Spectrum),
    action: VariantAction,
    variant_id: Uuid,
) {
    if history.len() >= HISTORY_CAP {
        history.pop_front();
    }
    history.push_back(VariantChange {
        at: Utc::now(),
        model: key.0,
        spectrum: key.1,
        action,
        variant_id,
    });
}
