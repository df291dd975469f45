//! Optimization-cycle building blocks: candidate construction and
//! regression-to-key fanout.

use crate::engine::{PatternMatch, StrategyKind, StrategySnapshot, RegressionAnalysis};
use crate::gateway::{PromptVariant, VariantParameters};
use crate::trace::Spectrum;

/// Exemplars appended when grounding a prompt.
const GROUNDING_EXEMPLARS: usize = 3;

/// Build a treatment candidate by applying a strategy to the deployed
/// parent variant.
pub(crate) fn build_candidate(
    strategy: &StrategySnapshot,
    parent: &PromptVariant,
    exemplars: &[PatternMatch],
) -> PromptVariant {
    let mut candidate = PromptVariant::candidate_from(parent);
    match strategy.kind {
        StrategyKind::ExemplarGrounding => {
            if !exemplars.is_empty() {
                let mut block = String::from("\n\nHigh-quality exemplars:\n");
                for exemplar in exemplars.iter().take(GROUNDING_EXEMPLARS) {
                    block.push_str("- ");
                    block.push_str(&exemplar.exemplar_text);
                    block.push('\n');
                }
                candidate.system_prompt.push_str(&block);
            }
        }
        StrategyKind::TightenSampling => {
            candidate.parameters = VariantParameters {
                temperature: (parent.parameters.temperature * 0.5).max(0.0),
                top_p: parent.parameters.top_p.min(0.9),
                ..parent.parameters
            };
        }
        StrategyKind::ClarifyInstruction => {
            candidate.system_prompt.push_str(
                "\n\nBe precise: answer only what was asked, state uncertainty explicitly, \
                 and keep the response structure consistent.",
            );
        }
        StrategyKind::ExpandBudget => {
            candidate.parameters = VariantParameters {
                max_tokens: (parent.parameters.max_tokens * 2).min(4_096),
                ..parent.parameters
            };
        }
    }
    candidate
}

/// Expand a regression analysis into the (model, spectrum) keys to
/// optimize. An empty affected list on either axis means "no attribution
/// on that axis", so every active value passes the filter.
pub(crate) fn regression_keys(
    analysis: &RegressionAnalysis,
    active_keys: &[(String, Spectrum)],
) -> Vec<(String, Spectrum)> {
    active_keys
        .iter()
        .filter(|(model, spectrum)| {
            (analysis.affected_models.is_empty() || analysis.affected_models.contains(model))
                && (analysis.affected_spectrums.is_empty()
                    || analysis.affected_spectrums.contains(spectrum))
        })
        .cloned()
        .collect()
}
