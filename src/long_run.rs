//! Long-Run Loop: iterated candidate rounds over the Improvement Loop,
//! updating the baseline on each round's best acceptance.

use async_trait::async_trait;

use crate::improvement::{self, CandidateResult, Evaluator, MetricSnapshot, Policy};
use crate::planner::LongRunSpec;

/// Read-only context handed to a [`CandidateGenerator`] for one iteration.
pub struct LongRunContext<'a, S> {
    pub iteration: u32,
    pub state: &'a S,
    pub baseline: &'a MetricSnapshot,
    pub baseline_score: f64,
    pub rounds: &'a [Vec<CandidateResult>],
    pub accepted_history: &'a [CandidateResult],
}

/// Produces the next round's candidates from the current context. An
/// empty return stops the loop (step 2 of §4.8).
#[async_trait]
pub trait CandidateGenerator<C, S>: Send + Sync
where
    C: Send + Sync,
    S: Send + Sync,
{
    async fn generate(&self, ctx: &LongRunContext<'_, S>) -> Vec<C>;
}

/// Outcome of driving a [`run_long_run_loop`] call to completion.
pub struct LongRunOutcome<S> {
    pub rounds: Vec<Vec<CandidateResult>>,
    pub accepted_history: Vec<CandidateResult>,
    pub final_baseline: MetricSnapshot,
    pub final_baseline_score: f64,
    pub final_state: S,
}

/// Run the Long-Run Loop: iterate `0..spec.max_iterations`, each iteration
/// generating candidates, scoring them against the current baseline via
/// one Improvement Loop round, and folding the round's best acceptance (if
/// any) back into the baseline and caller state.
///
/// `on_accepted` folds state given the round's best-accepted result;
/// pass `|state, _| state` for runs that don't thread state through.
pub async fn run_long_run_loop<C, S, G, E, F>(
    spec: &LongRunSpec,
    initial_baseline: MetricSnapshot,
    initial_state: S,
    generator: &G,
    evaluator: &E,
    mut on_accepted: F,
) -> LongRunOutcome<S>
where
    C: Send + Sync,
    S: Send + Sync,
    G: CandidateGenerator<C, S>,
    E: Evaluator<C>,
    F: FnMut(S, &CandidateResult) -> S,
{
    let policy = Policy {
        objectives: spec.objectives.clone(),
        constraints: spec.constraints.clone(),
        min_score_delta: spec.min_score_delta,
    };

    let mut baseline = initial_baseline;
    let mut baseline_score = improvement::score_snapshot(&baseline, &policy.objectives).unwrap_or(0.0);
    let mut state = initial_state;
    let mut rounds: Vec<Vec<CandidateResult>> = Vec::new();
    let mut accepted_history: Vec<CandidateResult> = Vec::new();

    for iteration in 0..spec.max_iterations {
        let ctx = LongRunContext {
            iteration,
            state: &state,
            baseline: &baseline,
            baseline_score,
            rounds: &rounds,
            accepted_history: &accepted_history,
        };
        let candidates = generator.generate(&ctx).await;
        if candidates.is_empty() {
            tracing::debug!(iteration, "long-run loop stopping: no candidates generated");
            break;
        }

        let results = improvement::run_improvement_loop(
            baseline.clone(),
            &policy,
            evaluator,
            &candidates,
            false,
        )
        .await;

        accepted_history.extend(results.iter().filter(|r| r.accepted).cloned());
        let best = improvement::best_accepted(&results).cloned();
        rounds.push(results);

        match best {
            Some(best) => {
                if let Some(snapshot) = best.snapshot.clone() {
                    baseline = snapshot;
                    baseline_score = best.score.unwrap_or(baseline_score);
                }
                state = on_accepted(state, &best);
            }
            None if spec.stop_when_no_accept => {
                tracing::debug!(iteration, "long-run loop stopping: no acceptance and stop_when_no_accept");
                break;
            }
            None => {}
        }
    }

    LongRunOutcome {
        rounds,
        accepted_history,
        final_baseline: baseline,
        final_baseline_score: baseline_score,
        final_state: state,
    }
}
