//! Planner: one LM call that turns a user request into a [`Plan`] (single
//! action loop, or an iterated long-run optimization).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::budget::BudgetLimits;
use crate::llm::{plan_response_format, ChatMessage, CompletionOptions, LMProvider};

const PLANNER_SYSTEM_PROMPT: &str = r#"You turn a user request into a Plan.
Respond with exactly one JSON object: {"mode":"single"|"long_run","task":"...",
"profile":"pure"|"hybrid","symbols":[...],"budget":{...},"longRun":{...}}.
Omit fields you don't need. Prefer "single" unless the request clearly asks
for iterated optimization against objectives and constraints."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    Single,
    LongRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Pure,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Minimize,
    Maximize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintComparator {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintSource {
    Absolute,
    Delta,
    Ratio,
    DeltaRatio,
}

impl Default for ConstraintSource {
    fn default() -> Self {
        ConstraintSource::Absolute
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    pub key: String,
    pub direction: Direction,
    pub symbol: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub key: String,
    pub comparator: ConstraintComparator,
    pub value: f64,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub source: ConstraintSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LongRunSpec {
    pub objectives: Vec<Objective>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub stop_when_no_accept: bool,
    #[serde(default)]
    pub min_score_delta: f64,
}

fn default_max_iterations() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub mode: PlanMode,
    pub task: String,
    #[serde(default)]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    #[serde(default)]
    pub budget: Option<BudgetLimits>,
    #[serde(default)]
    pub long_run: Option<LongRunSpec>,
}

impl Plan {
    pub fn single(task: impl Into<String>) -> Self {
        Self {
            mode: PlanMode::Single,
            task: task.into(),
            profile: None,
            symbols: None,
            budget: None,
            long_run: None,
        }
    }
}

pub struct Planner {
    lm: Arc<dyn LMProvider>,
}

impl Planner {
    pub fn new(lm: Arc<dyn LMProvider>) -> Self {
        Self { lm }
    }

    /// Obtain a [`Plan`] for `task`. A malformed or unparsable LM response
    /// degrades to `{mode: single, task}`; a `long_run` plan missing its
    /// `longRun` spec also degrades to `single`, per the coercion rule --
    /// the only automatic promotion is a demotion, never the reverse.
    pub async fn plan(&self, task: &str) -> Plan {
        let messages = vec![
            ChatMessage::system(PLANNER_SYSTEM_PROMPT),
            ChatMessage::user(task.to_string()),
        ];
        let options = CompletionOptions {
            response_format: Some(plan_response_format()),
            ..Default::default()
        };

        let text = match self.lm.complete(&messages, &options).await {
            Ok(completion) => completion.text,
            Err(_) => return Plan::single(task),
        };

        match parse_plan(&text) {
            Some(plan) => normalize_plan(plan, task),
            None => Plan::single(task),
        }
    }
}

fn parse_plan(text: &str) -> Option<Plan> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let candidate = &text[start..=end];
    let value: Value = serde_json::from_str(candidate).ok()?;
    serde_json::from_value(value).ok()
}

fn normalize_plan(plan: Plan, task: &str) -> Plan {
    if plan.mode == PlanMode::LongRun && plan.long_run.is_none() {
        return Plan::single(task);
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::TestLMProvider;

    #[tokio::test]
    async fn malformed_plan_falls_back_to_single() {
        let lm = Arc::new(TestLMProvider::new(["not json at all"]));
        let planner = Planner::new(lm);
        let plan = planner.plan("summarize this").await;
        assert_eq!(plan.mode, PlanMode::Single);
        assert_eq!(plan.task, "summarize this");
    }

    #[tokio::test]
    async fn long_run_without_spec_degrades_to_single() {
        let lm = Arc::new(TestLMProvider::new([r#"{"mode":"long_run","task":"optimize"}"#]));
        let planner = Planner::new(lm);
        let plan = planner.plan("optimize it").await;
        assert_eq!(plan.mode, PlanMode::Single);
    }

    #[tokio::test]
    async fn well_formed_single_plan_is_kept() {
        let lm = Arc::new(TestLMProvider::new([r#"{"mode":"single","task":"sum the column"}"#]));
        let planner = Planner::new(lm);
        let plan = planner.plan("please sum it").await;
        assert_eq!(plan.mode, PlanMode::Single);
        assert_eq!(plan.task, "sum the column");
    }
}
