//! Improvement Loop: one round of candidate scoring/accept-reject against
//! a [`Policy`] of objectives and constraints.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::planner::{Constraint, ConstraintComparator, ConstraintSource, Direction, Objective};

/// A finite-valued metric bundle produced by evaluating a candidate.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricSnapshot {
    pub metrics: HashMap<String, f64>,
    #[serde(default)]
    pub gates: HashMap<String, bool>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

/// Objective/constraint declaration used to score and validate snapshots.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub objectives: Vec<Objective>,
    pub constraints: Vec<Constraint>,
    pub min_score_delta: f64,
}

/// Evaluates one candidate into a [`MetricSnapshot`].
#[async_trait]
pub trait Evaluator<C: Send + Sync>: Send + Sync {
    async fn evaluate(&self, candidate: &C) -> Result<MetricSnapshot>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateResult {
    pub accepted: bool,
    pub reasons: Vec<String>,
    #[serde(default)]
    pub snapshot: Option<MetricSnapshot>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub score_delta: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// `score = Σ_i (direction_i == maximize ? +value_i : -value_i) * weight_i`.
pub fn score_snapshot(snapshot: &MetricSnapshot, objectives: &[Objective]) -> Option<f64> {
    let mut total = 0.0;
    for objective in objectives {
        let value = *snapshot.metrics.get(&objective.key)?;
        let signed = match objective.direction {
            Direction::Maximize => value,
            Direction::Minimize => -value,
        };
        total += signed * objective.weight;
    }
    Some(total)
}

fn constraint_target(snapshot_value: f64, baseline_value: Option<f64>, source: ConstraintSource) -> Option<f64> {
    match source {
        ConstraintSource::Absolute => Some(snapshot_value),
        ConstraintSource::Delta => Some(snapshot_value - baseline_value?),
        ConstraintSource::Ratio => {
            let baseline = baseline_value?;
            if baseline == 0.0 {
                None
            } else {
                Some(snapshot_value / baseline)
            }
        }
        ConstraintSource::DeltaRatio => {
            let baseline = baseline_value?;
            if baseline == 0.0 {
                None
            } else {
                Some((snapshot_value - baseline) / baseline)
            }
        }
    }
}

fn compare(target: f64, comparator: ConstraintComparator, value: f64) -> bool {
    match comparator {
        ConstraintComparator::Lt => target < value,
        ConstraintComparator::Lte => target <= value,
        ConstraintComparator::Gt => target > value,
        ConstraintComparator::Gte => target >= value,
        ConstraintComparator::Eq => target == value,
    }
}

/// Validates one candidate's snapshot, per §4.7 step 2. Returns the
/// collected reasons plus whether the snapshot itself is invalid
/// (non-finite metric, missing objective metric, or an unusable
/// constraint source) as opposed to merely rejected by a constraint or
/// gate on an otherwise-valid snapshot.
fn validate_snapshot(
    snapshot: &MetricSnapshot,
    policy: &Policy,
    baseline: &MetricSnapshot,
) -> (Vec<String>, bool) {
    let mut reasons = Vec::new();
    let mut invalid = false;

    for (key, value) in &snapshot.metrics {
        if !value.is_finite() {
            reasons.push(format!("invalid_metric:{key}"));
            invalid = true;
        }
    }

    for objective in &policy.objectives {
        if !snapshot.metrics.contains_key(&objective.key) {
            reasons.push(format!("metric_missing:{}", objective.key));
            invalid = true;
        }
    }

    for constraint in &policy.constraints {
        let Some(&value) = snapshot.metrics.get(&constraint.key) else {
            continue;
        };
        let baseline_value = baseline.metrics.get(&constraint.key).copied();
        match constraint_target(value, baseline_value, constraint.source) {
            Some(target) => {
                if !compare(target, constraint.comparator, constraint.value) {
                    reasons.push(format!("constraint_failed:{}", constraint.key));
                }
            }
            None => {
                reasons.push(format!("invalid_constraint_source:{}", constraint.key));
                invalid = true;
            }
        }
    }

    for (name, ok) in &snapshot.gates {
        if !ok {
            reasons.push(format!("gate_failed:{name}"));
        }
    }

    if invalid {
        reasons.insert(0, "invalid_snapshot".to_string());
    }

    (reasons, invalid)
}

/// Run one round of the Improvement Loop over `candidates` in order.
/// `updateBaselineOnAccept`: if set, each acceptance refreshes the
/// baseline used to validate subsequent candidates in this same round.
pub async fn run_improvement_loop<C: Send + Sync, E: Evaluator<C>>(
    baseline: MetricSnapshot,
    policy: &Policy,
    evaluator: &E,
    candidates: &[C],
    update_baseline_on_accept: bool,
) -> Vec<CandidateResult> {
    let mut current_baseline = baseline;
    let mut current_baseline_score = score_snapshot(&current_baseline, &policy.objectives).unwrap_or(0.0);
    let mut results = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let snapshot = match evaluator.evaluate(candidate).await {
            Ok(s) => s,
            Err(e) => {
                results.push(CandidateResult {
                    accepted: false,
                    reasons: vec!["evaluation_error".to_string()],
                    snapshot: None,
                    score: None,
                    score_delta: None,
                    error: Some(e.to_string()),
                });
                continue;
            }
        };

        let (mut reasons, invalid) = validate_snapshot(&snapshot, policy, &current_baseline);
        let is_valid = !invalid;

        let (score, score_delta) = if is_valid {
            let score = score_snapshot(&snapshot, &policy.objectives).unwrap_or(0.0);
            let delta = score - current_baseline_score;
            if delta < policy.min_score_delta {
                reasons.push("score_delta_too_small".to_string());
            }
            (Some(score), Some(delta))
        } else {
            (None, None)
        };

        let accepted = reasons.is_empty();
        if accepted && update_baseline_on_accept {
            current_baseline = snapshot.clone();
            current_baseline_score = score.unwrap_or(current_baseline_score);
        }

        results.push(CandidateResult {
            accepted,
            reasons,
            snapshot: Some(snapshot),
            score,
            score_delta,
            error: None,
        });
    }

    results
}

/// The accepted candidate's result with the highest `score`, if any.
pub fn best_accepted(results: &[CandidateResult]) -> Option<&CandidateResult> {
    results
        .iter()
        .filter(|r| r.accepted)
        .max_by(|a, b| a.score.unwrap_or(f64::MIN).total_cmp(&b.score.unwrap_or(f64::MIN)))
}
