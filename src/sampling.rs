//! Turning comparison-engine output into per-field work.
//!
//! The comparison engine (outside this crate) scores every document's
//! extracted value against ground truth. This module picks which failures
//! are worth showing to the model, works out which company should never be
//! returned for counter-party fields, and builds the [`FieldTask`]s the
//! engine drives.

use crate::config::OptimizerConfig;
use crate::schema::{
    FailureExample, FieldOutcome, FieldSpec, FieldSummary, FieldTask, SampledDocument,
    SuccessExample,
};
use crate::templates::is_counterparty_field;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Comparison results for one field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldComparison {
    pub field_key: String,
    /// Share of documents where the extracted value matched, 0.0 - 1.0.
    pub accuracy: f64,
    #[serde(default)]
    pub failures: Vec<FailureExample>,
    #[serde(default)]
    pub successes: Vec<SuccessExample>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResults {
    pub fields: Vec<FieldComparison>,
}

impl ComparisonResults {
    pub fn new(fields: Vec<FieldComparison>) -> Self {
        Self { fields }
    }

    pub fn get(&self, field_key: &str) -> Option<&FieldComparison> {
        self.fields.iter().find(|f| f.field_key == field_key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One field that has failures to work on.
#[derive(Debug, Clone)]
pub struct FieldPlan {
    /// Position in the operator's field list, used to keep summaries in order.
    pub index: usize,
    pub task: FieldTask,
    pub comparison: FieldComparison,
    pub samples: Vec<SampledDocument>,
}

fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Up to `limit` failures, favouring distinct failure modes: the first
/// failure of every distinct (predicted, expected) pair comes before any
/// repeat of a pattern already shown. Original order is kept within each pass.
pub fn select_failures(failures: &[FailureExample], limit: usize) -> Vec<&FailureExample> {
    let mut seen = HashSet::new();
    let mut picked = Vec::with_capacity(limit.min(failures.len()));
    let mut repeats = Vec::new();

    for failure in failures {
        let pattern = (
            normalize(&failure.predicted_value),
            normalize(&failure.expected_value),
        );
        if seen.insert(pattern) {
            picked.push(failure);
        } else {
            repeats.push(failure);
        }
    }

    picked.extend(repeats);
    picked.truncate(limit);
    picked
}

/// The company a counter-party field keeps wrongly returning: a predicted
/// value seen in at least two failures that never matches any expected
/// value, including the correct values in `successes`. The most frequent
/// candidate wins; ties go to the first seen.
pub fn derive_excluded_entity(
    failures: &[FailureExample],
    successes: &[SuccessExample],
) -> Option<String> {
    let expected: HashSet<String> = failures
        .iter()
        .map(|f| normalize(&f.expected_value))
        .chain(successes.iter().map(|s| normalize(&s.value)))
        .collect();

    let mut counts: HashMap<String, (usize, usize, &str)> = HashMap::new();
    for (position, failure) in failures.iter().enumerate() {
        let key = normalize(&failure.predicted_value);
        if key.is_empty() || expected.contains(&key) {
            continue;
        }
        counts
            .entry(key)
            .or_insert((0, position, failure.predicted_value.trim()))
            .0 += 1;
    }

    counts
        .into_values()
        .filter(|(count, _, _)| *count >= 2)
        .min_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)))
        .map(|(_, _, original)| original.to_string())
}

/// Builds a plan for every field with failures. Fields without failures, or
/// without comparison data, are returned as finished summaries instead.
pub fn plan_fields(
    fields: &[FieldSpec],
    results: &ComparisonResults,
    config: &OptimizerConfig,
) -> (Vec<FieldPlan>, Vec<(usize, FieldSummary)>) {
    let mut plans = Vec::new();
    let mut finished = Vec::new();

    for (index, spec) in fields.iter().enumerate() {
        let mut task = FieldTask::new(
            spec.descriptor.clone(),
            spec.current_instruction.clone(),
            config.max_iterations,
            config.history_limit,
        );

        let Some(comparison) = results.get(&spec.descriptor.key) else {
            let mut summary = FieldSummary::for_task(&task, FieldOutcome::Skipped);
            summary.error = Some("no comparison results for this field".to_string());
            finished.push((index, summary));
            continue;
        };

        task.accuracy_before = comparison.accuracy;
        if comparison.failures.is_empty() {
            debug!(
                "Field {} has no failures; skipping",
                spec.descriptor.display_name
            );
            finished.push((index, FieldSummary::for_task(&task, FieldOutcome::Skipped)));
            continue;
        }

        let samples: Vec<SampledDocument> =
            select_failures(&comparison.failures, config.samples_per_field)
                .into_iter()
                .map(|failure| SampledDocument {
                    document_id: failure.document_id.clone(),
                    field_key: spec.descriptor.key.clone(),
                    predicted_value: failure.predicted_value.clone(),
                    expected_value: failure.expected_value.clone(),
                })
                .collect();
        task.sampled_doc_ids = samples.iter().map(|s| s.document_id.clone()).collect();

        if is_counterparty_field(&spec.descriptor.display_name) {
            task.exclude_entity = config.exclude_entity.clone().or_else(|| {
                derive_excluded_entity(&comparison.failures, &comparison.successes)
            });
            if let Some(entity) = &task.exclude_entity {
                debug!(
                    "Field {} excludes entity \"{}\"",
                    spec.descriptor.display_name, entity
                );
            }
        }

        plans.push(FieldPlan {
            index,
            task,
            comparison: comparison.clone(),
            samples,
        });
    }

    (plans, finished)
}
