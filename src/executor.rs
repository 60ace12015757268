//! Planned Executor: bridges a [`Plan`] to either the Root Loop (single
//! mode) or the Long-Run Loop (long_run mode).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::budget::BudgetLimits;
use crate::docstore::{DocumentStore, InMemoryDocumentStore};
use crate::env::{Environment, SymbolCall, SymbolTable};
use crate::error::{Error, Result};
use crate::fingerprint::fingerprint_str;
use crate::improvement::{Evaluator, MetricSnapshot};
use crate::llm::LMProvider;
use crate::long_run::{run_long_run_loop, CandidateGenerator, LongRunContext, LongRunOutcome};
use crate::planner::{Constraint, Objective, Plan, PlanMode};
use crate::root_loop::{RootLoop, RootLoopConfig, RootLoopOutcome};

/// Profile-level defaults the executor merges under any plan-level and
/// caller-supplied overrides.
#[derive(Clone, Default)]
pub struct ProfileDefaults {
    pub budget: Option<BudgetLimits>,
    pub root_loop: Option<RootLoopConfig>,
}

/// Budget is a shallow merge `profile -> plan -> base`: the most specific
/// non-empty value wins, with the caller-supplied `base` taking final
/// precedence over a plan-level override, which in turn wins over the
/// profile default.
fn merge_budget(
    profile: Option<BudgetLimits>,
    plan: Option<BudgetLimits>,
    base: Option<BudgetLimits>,
) -> BudgetLimits {
    base.or(plan).or(profile).unwrap_or_default()
}

/// Inputs required to drive the long_run branch: the Long-Run Loop needs a
/// host-supplied candidate generator (e.g. "propose the next code
/// variant") since candidate production is inherently host-specific
/// (Non-goals: git worktree helpers, build/lint integrations).
pub struct LongRunInputs {
    pub prompt: String,
    pub prompt_id: String,
    pub initial_baseline: MetricSnapshot,
    pub initial_state: Value,
    pub generator: Arc<dyn CandidateGenerator<Value, Value>>,
}

/// Result of [`PlannedExecutor::execute`].
pub enum ExecutionOutcome {
    Single(RootLoopOutcome),
    LongRun(LongRunOutcome<Value>),
}

/// Wraps a host's [`CandidateGenerator`] to record the iteration/state pair
/// the Long-Run Loop is currently operating on, so [`SymbolMetricEvaluator`]
/// can see it when it runs immediately afterward. The Long-Run Loop drives
/// generate-then-evaluate strictly in sequence within one iteration, so
/// this is race-free despite the shared cell.
struct RecordingGenerator {
    inner: Arc<dyn CandidateGenerator<Value, Value>>,
    cell: Arc<Mutex<(u32, Value)>>,
}

#[async_trait]
impl CandidateGenerator<Value, Value> for RecordingGenerator {
    async fn generate(&self, ctx: &LongRunContext<'_, Value>) -> Vec<Value> {
        *self.cell.lock().await = (ctx.iteration, ctx.state.clone());
        self.inner.generate(ctx).await
    }
}

/// Evaluates a candidate by invoking the external symbol named on each
/// objective/constraint with `{candidate, iteration, state, metricKey,
/// task}`, per §4.9's "objective/constraint readers".
struct SymbolMetricEvaluator {
    symbols: SymbolTable,
    objectives: Vec<Objective>,
    constraints: Vec<Constraint>,
    task: String,
    prompt: String,
    prompt_id: String,
    cell: Arc<Mutex<(u32, Value)>>,
}

impl SymbolMetricEvaluator {
    fn metric_symbols(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .objectives
            .iter()
            .map(|o| (o.key.clone(), o.symbol.clone()))
            .collect();
        for c in &self.constraints {
            if let Some(symbol) = &c.symbol {
                out.push((c.key.clone(), symbol.clone()));
            }
        }
        out
    }
}

#[async_trait]
impl Evaluator<Value> for SymbolMetricEvaluator {
    async fn evaluate(&self, candidate: &Value) -> Result<MetricSnapshot> {
        let (iteration, state) = self.cell.lock().await.clone();
        let mut metrics = HashMap::new();
        for (key, symbol) in self.metric_symbols() {
            let handler = self
                .symbols
                .get(&symbol)
                .ok_or_else(|| Error::execution(format!("unknown symbol: {symbol}")))?;
            let call = SymbolCall {
                symbol: symbol.clone(),
                prompt: self.prompt.clone(),
                prompt_id: self.prompt_id.clone(),
                depth: 0,
                scratch: serde_json::Map::new(),
                args: Some(json!({
                    "candidate": candidate,
                    "iteration": iteration,
                    "state": state,
                    "metricKey": key,
                    "task": self.task,
                })),
                input: None,
            };
            let value = handler.call(call).await?;
            let n = value
                .as_f64()
                .filter(|n| n.is_finite())
                .ok_or_else(|| Error::execution(format!("metric symbol {symbol} must return a finite number")))?;
            metrics.insert(key, n);
        }
        Ok(MetricSnapshot { metrics, gates: HashMap::new(), meta: None })
    }
}

/// Bridges a [`Plan`] to the Root Loop or Long-Run Loop.
pub struct PlannedExecutor {
    lm: Arc<dyn LMProvider>,
    symbols: SymbolTable,
}

impl PlannedExecutor {
    pub fn new(lm: Arc<dyn LMProvider>, symbols: SymbolTable) -> Self {
        Self { lm, symbols }
    }

    /// Execute `plan` against `prompt`. `doc_store`, if supplied, must be
    /// keyed by `fingerprint_str(prompt)` (the same convention
    /// [`Environment::new_root`] and the sub-RLM dispatcher use); when
    /// omitted an in-memory store is built for `prompt` automatically.
    /// `long_run_inputs` is required iff `plan.mode == long_run` (a
    /// malformed/demoted plan per §4.9's coercion rule is always `single`,
    /// so callers that never offer long-run plans can pass `None`).
    pub async fn execute(
        &self,
        plan: Plan,
        prompt: String,
        doc_store: Option<Arc<dyn DocumentStore>>,
        profile: ProfileDefaults,
        base_budget: Option<BudgetLimits>,
        long_run_inputs: Option<LongRunInputs>,
    ) -> Result<ExecutionOutcome> {
        match plan.mode {
            PlanMode::Single => {
                let limits = merge_budget(profile.budget, plan.budget, base_budget);
                let config = profile.root_loop.unwrap_or_default();
                let doc_store = doc_store.unwrap_or_else(|| {
                    Arc::new(InMemoryDocumentStore::single(fingerprint_str(&prompt), prompt.clone()))
                });
                let env = Environment::new_root(prompt, doc_store, limits);
                let root_loop = RootLoop::new(self.lm.clone(), config, self.symbols.clone());
                let outcome = root_loop.run(env, plan.task.clone()).await?;
                Ok(ExecutionOutcome::Single(outcome))
            }
            PlanMode::LongRun => {
                let spec = plan
                    .long_run
                    .clone()
                    .expect("coercion guarantees longRun is present whenever mode is long_run");
                let inputs = long_run_inputs
                    .ok_or_else(|| Error::execution("long_run plan requires generator/baseline inputs"))?;

                let cell = Arc::new(Mutex::new((0u32, inputs.initial_state.clone())));
                let evaluator = SymbolMetricEvaluator {
                    symbols: self.symbols.clone(),
                    objectives: spec.objectives.clone(),
                    constraints: spec.constraints.clone(),
                    task: plan.task.clone(),
                    prompt: inputs.prompt,
                    prompt_id: inputs.prompt_id,
                    cell: cell.clone(),
                };
                let generator = RecordingGenerator { inner: inputs.generator, cell };

                let outcome = run_long_run_loop(
                    &spec,
                    inputs.initial_baseline,
                    inputs.initial_state,
                    &generator,
                    &evaluator,
                    |state, _result| state,
                )
                .await;
                Ok(ExecutionOutcome::LongRun(outcome))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::TestLMProvider;
    use crate::planner::{Direction, LongRunSpec};

    #[tokio::test]
    async fn single_mode_runs_the_root_loop() {
        let lm = Arc::new(TestLMProvider::new([
            r#"{"op":"set","path":"answer","value":"ok"}"#,
            r#"{"op":"finalize","from":"answer"}"#,
        ]));
        let executor = PlannedExecutor::new(lm, SymbolTable::new());
        let plan = Plan::single("say ok");

        let outcome = executor
            .execute(plan, "hello world".to_string(), None, ProfileDefaults::default(), None, None)
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::Single(o) => assert_eq!(o.final_value, "ok"),
            _ => panic!("expected single outcome"),
        }
    }

    struct FixedCandidates(Vec<Vec<Value>>, std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl CandidateGenerator<Value, Value> for FixedCandidates {
        async fn generate(&self, _ctx: &LongRunContext<'_, Value>) -> Vec<Value> {
            let i = self.1.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.0.get(i).cloned().unwrap_or_default()
        }
    }

    struct EchoSymbol;

    #[async_trait]
    impl crate::env::ExternalSymbol for EchoSymbol {
        async fn call(&self, call: SymbolCall) -> Result<Value> {
            let candidate = call.args.and_then(|a| a.get("candidate").cloned()).unwrap_or(json!(0.0));
            Ok(candidate)
        }
    }

    #[tokio::test]
    async fn long_run_mode_scores_candidates_via_symbol() {
        let lm = Arc::new(TestLMProvider::new(Vec::<String>::new()));
        let mut symbols: SymbolTable = SymbolTable::new();
        symbols.insert("score".to_string(), Arc::new(EchoSymbol));
        let executor = PlannedExecutor::new(lm, symbols);

        let mut plan = Plan::single("optimize");
        plan.mode = PlanMode::LongRun;
        plan.long_run = Some(LongRunSpec {
            objectives: vec![Objective {
                key: "score".to_string(),
                direction: Direction::Maximize,
                symbol: "score".to_string(),
                weight: 1.0,
            }],
            constraints: vec![],
            max_iterations: 1,
            stop_when_no_accept: false,
            min_score_delta: 0.0,
        });

        let generator = Arc::new(FixedCandidates(
            vec![vec![json!(3.0), json!(9.0)]],
            std::sync::atomic::AtomicUsize::new(0),
        ));
        let inputs = LongRunInputs {
            prompt: "doc".to_string(),
            prompt_id: "docid".to_string(),
            initial_baseline: MetricSnapshot {
                metrics: HashMap::from([("score".to_string(), 0.0)]),
                ..Default::default()
            },
            initial_state: json!({}),
            generator,
        };

        let outcome = executor
            .execute(plan, "doc".to_string(), None, ProfileDefaults::default(), None, Some(inputs))
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::LongRun(o) => {
                assert_eq!(o.final_baseline.metrics["score"], 9.0);
            }
            _ => panic!("expected long-run outcome"),
        }
    }
}
