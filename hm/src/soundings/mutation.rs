//! Prompt mutations for sounding attempts
//!
//! Attempt #0 always runs the unmutated prompt (the baseline). Later
//! attempts vary per the configured policy: `augment` appends a variation
//! instruction, `rewrite` reframes the whole prompt through a template (the
//! template is logged as `mutation_template`). Reforge rounds use
//! rewrite-style mutations conditioned on the previous winner.

use serde::{Deserialize, Serialize};

use crate::cascade::MutationMode;

/// Instructions appended by `augment` mutations, rotated by attempt index
const VARIATION_INSTRUCTIONS: &[&str] = &[
    "Approach this from an unconventional angle.",
    "Favor brevity and directness over completeness.",
    "Reason through the problem step by step before answering.",
    "Consider edge cases the obvious answer would miss.",
    "Optimise for novelty; avoid the most common framing.",
    "Be rigorous: justify each claim you make.",
    "Prefer concrete examples over abstract description.",
];

/// Templates used by `rewrite` mutations; `{instructions}` is replaced by
/// the rendered prompt
const REWRITE_TEMPLATES: &[&str] = &[
    "Solve the task below, but deliberately take a different approach than the obvious one:\n\n{instructions}",
    "Treat the task below as if explaining to a skeptical expert; anticipate their objections:\n\n{instructions}",
    "Complete the task below with the strongest answer you can, then tighten it before responding:\n\n{instructions}",
];

/// Template used by reforge refinement rounds; `{prior}` is the previous
/// winner's output
const REFINE_TEMPLATE: &str = "A previous attempt produced the answer below. Produce a strictly \
better version: fix weaknesses, sharpen the strengths, keep what works.\n\nPrevious answer:\n{prior}";

/// A concrete mutation applied to one attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutation {
    pub mutation_type: MutationMode,
    /// The variation text (appended for augment, the refine directive for
    /// reforge rounds)
    pub instruction: String,
    /// For rewrite mutations: the template that reshaped the prompt
    pub template: Option<String>,
}

/// The mutation for a given attempt index, or `None` for the baseline
pub fn mutation_for_attempt(mode: Option<MutationMode>, index: u32) -> Option<Mutation> {
    if index == 0 {
        return None;
    }
    match mode {
        None | Some(MutationMode::None) => None,
        Some(MutationMode::Augment) => {
            let instruction = VARIATION_INSTRUCTIONS[(index as usize - 1) % VARIATION_INSTRUCTIONS.len()];
            Some(Mutation {
                mutation_type: MutationMode::Augment,
                instruction: instruction.to_string(),
                template: None,
            })
        }
        Some(MutationMode::Rewrite) => {
            let template = REWRITE_TEMPLATES[(index as usize - 1) % REWRITE_TEMPLATES.len()];
            Some(Mutation {
                mutation_type: MutationMode::Rewrite,
                instruction: String::new(),
                template: Some(template.to_string()),
            })
        }
    }
}

/// A refinement mutation conditioned on the prior round's winner. Every
/// attempt of a reforge round gets one, including attempt #0.
pub fn refine_mutation(prior_output: &str, index: u32) -> Mutation {
    let mut instruction = REFINE_TEMPLATE.replace("{prior}", prior_output);
    if index > 0 {
        // Diversify the refinement directions
        let variation = VARIATION_INSTRUCTIONS[(index as usize - 1) % VARIATION_INSTRUCTIONS.len()];
        instruction.push_str(&format!("\n\nAdditionally: {variation}"));
    }
    Mutation {
        mutation_type: MutationMode::Rewrite,
        instruction,
        template: Some(REFINE_TEMPLATE.to_string()),
    }
}

/// Apply a mutation to a rendered prompt
pub fn apply_mutation(prompt: &str, mutation: &Mutation) -> String {
    match mutation.mutation_type {
        MutationMode::Augment => format!("{prompt}\n\n{}", mutation.instruction),
        MutationMode::Rewrite => match &mutation.template {
            Some(template) if template.contains("{instructions}") => {
                template.replace("{instructions}", prompt)
            }
            // Refine-style: the instruction stands alone, prompt provides context
            _ => format!("{prompt}\n\n{}", mutation.instruction),
        },
        MutationMode::None => prompt.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_attempt_unmutated() {
        assert!(mutation_for_attempt(Some(MutationMode::Augment), 0).is_none());
        assert!(mutation_for_attempt(None, 3).is_none());
        assert!(mutation_for_attempt(Some(MutationMode::None), 2).is_none());
    }

    #[test]
    fn test_augment_appends() {
        let mutation = mutation_for_attempt(Some(MutationMode::Augment), 1).unwrap();
        assert_eq!(mutation.mutation_type, MutationMode::Augment);
        let applied = apply_mutation("Do the task.", &mutation);
        assert!(applied.starts_with("Do the task."));
        assert!(applied.contains(&mutation.instruction));
    }

    #[test]
    fn test_rewrite_reshapes() {
        let mutation = mutation_for_attempt(Some(MutationMode::Rewrite), 1).unwrap();
        assert!(mutation.template.is_some());
        let applied = apply_mutation("Do the task.", &mutation);
        assert!(applied.contains("Do the task."));
        assert_ne!(applied, "Do the task.");
        // The template wraps rather than appends
        assert!(!applied.starts_with("Do the task."));
    }

    #[test]
    fn test_attempts_vary_by_index() {
        let first = mutation_for_attempt(Some(MutationMode::Augment), 1).unwrap();
        let second = mutation_for_attempt(Some(MutationMode::Augment), 2).unwrap();
        assert_ne!(first.instruction, second.instruction);
    }

    #[test]
    fn test_refine_mutation_embeds_prior() {
        let mutation = refine_mutation("v1 answer", 0);
        assert!(mutation.instruction.contains("v1 answer"));
        assert_eq!(mutation.mutation_type, MutationMode::Rewrite);

        let varied = refine_mutation("v1 answer", 1);
        assert_ne!(mutation.instruction, varied.instruction);
    }
}
