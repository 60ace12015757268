//! End-to-end scenarios driving the Root Loop and Planned Executor through
//! a scripted LM, one test per concrete scenario.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use rlm_runtime::{
    BudgetLimits, ChatMessage, CompletionOptions, Completion, Environment,
    InMemoryDocumentStore, LMProvider, Result, RootLoop, RootLoopConfig, TestLMProvider,
};

/// Wraps a [`TestLMProvider`] and records every `messages` slice it is
/// handed, so the privacy property can be checked against what actually
/// reached the wire.
struct RecordingProvider {
    inner: TestLMProvider,
    seen: StdMutex<Vec<Vec<ChatMessage>>>,
}

impl RecordingProvider {
    fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            inner: TestLMProvider::new(responses),
            seen: StdMutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn all_contents(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .flat_map(|turn| turn.iter().map(|m| m.content.clone()))
            .collect()
    }
}

#[async_trait]
impl LMProvider for RecordingProvider {
    async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Result<Completion> {
        self.seen.lock().unwrap().push(messages.to_vec());
        self.inner.complete(messages, options).await
    }
}

fn env_for(prompt: &str) -> Environment {
    let prompt = prompt.to_string();
    let doc_store = Arc::new(InMemoryDocumentStore::single(
        rlm_runtime::fingerprint_str(&prompt),
        prompt.clone(),
    ));
    Environment::new_root(prompt, doc_store, BudgetLimits::default())
}

#[tokio::test]
async fn secret_safe_prompt_never_reaches_lm_messages() {
    let secret = "SECRET-LONG-PROMPT-1234567890";
    let lm = Arc::new(RecordingProvider::new([
        r#"{"op":"set","path":"scratch.answer","value":"ok"}"#,
        r#"{"op":"finalize","from":"answer"}"#,
    ]));
    let env = env_for(secret);
    let root_loop = RootLoop::new(lm.clone(), RootLoopConfig::default(), Default::default());

    let outcome = root_loop.run(env, "say ok".to_string()).await.unwrap();

    assert_eq!(outcome.final_value, "ok");
    for content in lm.all_contents() {
        assert!(!content.contains(secret), "prompt body leaked into LM message: {content}");
    }
}

#[tokio::test]
async fn csv_sum_via_document_ir() {
    let prompt = "name,score\nalice,3\nbob,5";
    let lm = Arc::new(TestLMProvider::new([
        r#"{"op":"doc_parse","format":"csv","out":"doc"}"#,
        r#"{"op":"doc_table_sum","in":"doc","column":"score","out":"answer"}"#,
        r#"{"op":"finalize","from":"answer"}"#,
    ]));
    let env = env_for(prompt);
    let root_loop = RootLoop::new(lm, RootLoopConfig::default(), Default::default());

    let outcome = root_loop.run(env, "sum the score column".to_string()).await.unwrap();

    assert_eq!(outcome.final_value, "8");
    assert_eq!(
        outcome.budget.prompt_read_chars_used,
        prompt.chars().count() as u64
    );
}

#[tokio::test]
async fn csv_filter_project_and_join() {
    let prompt = "name,score,team\nalice,3,a\nbob,5,b\nalice,7,c";
    let lm = Arc::new(TestLMProvider::new([
        r#"{"op":"doc_parse","format":"csv","out":"doc"}"#,
        r#"{"op":"doc_select_rows","in":"doc","column":"name","comparator":"eq","value":"alice","out":"filtered"}"#,
        r#"{"op":"doc_project_columns","in":"filtered","columns":["score"],"out":"projected","separator":"|"}"#,
        r#"{"op":"reduce_join","in":"projected","sep":"|","out":"joined"}"#,
        r#"{"op":"finalize","from":"joined"}"#,
    ]));
    let env = env_for(prompt);
    let root_loop = RootLoop::new(lm, RootLoopConfig::default(), Default::default());

    let outcome = root_loop
        .run(env, "scores for alice joined by pipe".to_string())
        .await
        .unwrap();

    assert_eq!(outcome.final_value, "3|7");
}

#[tokio::test]
async fn sub_call_caching_on_duplicate_items() {
    let prompt = "dup\ndup";
    let lm = Arc::new(TestLMProvider::new([
        r#"{"op":"chunk_newlines","max_lines":1,"out":"lines"}"#,
        r#"{"op":"sub_map","in":"lines","query_template":"sum: {{item}}","out":"subs"}"#,
        r#"{"op":"reduce_join","in":"subs","sep":"|","out":"joined"}"#,
        r#"{"op":"finalize","from":"joined"}"#,
        // each sub-RLM call runs this two-turn script against its own prompt
        r#"{"op":"set","path":"scratch.answer","value":"sub"}"#,
        r#"{"op":"finalize","from":"answer"}"#,
        r#"{"op":"set","path":"scratch.answer","value":"sub"}"#,
        r#"{"op":"finalize","from":"answer"}"#,
    ]));
    let env = env_for(prompt);
    let root_loop = RootLoop::new(lm, RootLoopConfig::default(), Default::default());

    let outcome = root_loop.run(env, "sum each line".to_string()).await.unwrap();

    assert_eq!(outcome.final_value, "sub|sub");
    assert_eq!(outcome.budget.sub_calls_used, 1);
    assert!(outcome.trace.cached_sub_call_count() >= 1);
}

#[tokio::test]
async fn error_recovery_after_invalid_action() {
    let lm = Arc::new(RecordingProvider::new([
        r#"{"op":"slice_prompt"}"#, // missing required start/end -> recoverable dsl error
        r#"{"op":"set","path":"scratch.answer","value":"ok"}"#,
        r#"{"op":"finalize","from":"answer"}"#,
    ]));
    let env = env_for("irrelevant prompt body");
    let root_loop = RootLoop::new(lm.clone(), RootLoopConfig::default(), Default::default());

    let outcome = root_loop.run(env, "say ok".to_string()).await.unwrap();

    assert_eq!(outcome.final_value, "ok");
    assert_eq!(lm.call_count(), 3);
}

#[tokio::test]
async fn improvement_loop_rejects_throughput_regression() {
    let baseline = rlm_runtime::MetricSnapshot {
        metrics: HashMap::from([
            ("latencyP95".to_string(), 120.0),
            ("throughput".to_string(), 100.0),
            ("testFailures".to_string(), 0.0),
        ]),
        ..Default::default()
    };
    let candidate_b = rlm_runtime::MetricSnapshot {
        metrics: HashMap::from([
            ("latencyP95".to_string(), 90.0),
            ("throughput".to_string(), 70.0),
            ("testFailures".to_string(), 0.0),
        ]),
        ..Default::default()
    };

    struct FixedEvaluator(rlm_runtime::MetricSnapshot);
    #[async_trait]
    impl rlm_runtime::Evaluator<()> for FixedEvaluator {
        async fn evaluate(&self, _candidate: &()) -> Result<rlm_runtime::MetricSnapshot> {
            Ok(self.0.clone())
        }
    }

    let policy = rlm_runtime::Policy {
        objectives: vec![rlm_runtime::Objective {
            key: "latencyP95".to_string(),
            direction: rlm_runtime::Direction::Minimize,
            symbol: "latency".to_string(),
            weight: 1.0,
        }],
        constraints: vec![rlm_runtime::Constraint {
            key: "throughput".to_string(),
            comparator: rlm_runtime::ConstraintComparator::Gte,
            value: 80.0,
            symbol: Some("throughput".to_string()),
            source: rlm_runtime::ConstraintSource::Absolute,
        }],
        min_score_delta: 0.0,
    };

    let results = rlm_runtime::run_improvement_loop(
        baseline,
        &policy,
        &FixedEvaluator(candidate_b),
        &[()],
        false,
    )
    .await;

    assert_eq!(results.len(), 1);
    assert!(!results[0].accepted);
    assert!(results[0].reasons.contains(&"constraint_failed:throughput".to_string()));
}
