//! Sub-RLM Dispatcher: cached, depth-checked, budget-accounted child RLM
//! invocation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;

use crate::budget::BudgetLimits;
use crate::docstore::{DocumentStore, InMemoryDocumentStore};
use crate::env::{Environment, SymbolTable};
use crate::error::{Error, Result};
use crate::fingerprint::fingerprint_json;
use crate::llm::LMProvider;
use crate::root_loop::{RootLoop, RootLoopConfig};

/// Fingerprint input: `sha256(JSON({promptId, query, subPrompt, options}))`
/// per §4.5. `subPrompt` is the caller's optional document override (not a
/// copy of `query`); `options` carries whatever would change the child's
/// behavior for an otherwise-identical query, currently just the budget
/// override, so two sub-calls that differ only in budget never collide.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheKeyInput<'a> {
    prompt_id: &'a str,
    query: &'a str,
    sub_prompt: Option<&'a str>,
    options: CacheKeyOptions,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheKeyOptions {
    budget: Option<BudgetLimits>,
}

/// Outcome of one sub-call, returned up to the caller so it can append the
/// right `sub_call` trace event against its own (mutable) environment.
pub struct SubCallResult {
    pub final_value: String,
    pub cached: bool,
    pub fingerprint: String,
}

/// Dispatches sub-RLM calls: fingerprint -> cache lookup -> depth check ->
/// consume sub-call -> spawn child -> cache write. Never mutates the
/// parent environment directly (no exclusive borrow needed for
/// concurrent dispatch) -- trace events are appended by the caller once
/// all in-flight calls have resolved.
pub struct SubRLMDispatcher {
    lm: Arc<dyn LMProvider>,
    config: RootLoopConfig,
    symbols: SymbolTable,
}

impl SubRLMDispatcher {
    pub fn new(lm: Arc<dyn LMProvider>, config: RootLoopConfig, symbols: SymbolTable) -> Self {
        Self { lm, config, symbols }
    }

    /// Run one sub-call to completion, following the cache/depth/budget
    /// protocol in §4.5. `sub_prompt` is the optional `{prompt?}` option:
    /// the document body the child environment reads, if different from
    /// `query` itself; `None` reuses `query` as the child's document, same
    /// as its task.
    pub async fn dispatch(
        &self,
        parent: &Environment,
        query: &str,
        sub_prompt: Option<&str>,
        budget_overrides: Option<BudgetLimits>,
    ) -> Result<SubCallResult> {
        let resolved_prompt = sub_prompt.unwrap_or(query);
        let cache_key = CacheKeyInput {
            prompt_id: &parent.prompt_id,
            query,
            sub_prompt,
            options: CacheKeyOptions { budget: budget_overrides },
        };
        let fingerprint = fingerprint_json(&cache_key);

        {
            let cache = parent.cache.lock().await;
            if let Some(cached) = cache.get(&fingerprint).cloned() {
                return Ok(SubCallResult {
                    final_value: cached,
                    cached: true,
                    fingerprint,
                });
            }
        }

        parent.budget.ensure_next_depth()?;
        parent.budget.consume_sub_call()?;

        let doc_store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::single(
            crate::fingerprint::fingerprint_str(resolved_prompt),
            resolved_prompt.to_string(),
        ));
        let child = Environment::new_child(parent, resolved_prompt.to_string(), doc_store, budget_overrides);

        let root_loop = RootLoop::new(self.lm.clone(), self.config.clone(), self.symbols.clone());
        // Box the recursive call: RootLoop::run -> interpreter -> this
        // dispatcher -> RootLoop::run would otherwise be an infinite-size future.
        let fut: Pin<Box<dyn Future<Output = Result<crate::root_loop::RootLoopOutcome>> + Send + '_>> =
            Box::pin(root_loop.run(child, query.to_string()));
        // Wrap: a child's error (even a fatal BudgetExceeded in its own
        // environment) surfaces to the parent as a recoverable sub-RLM
        // action error, per §7, not as a fatal error of the parent's own.
        let outcome = fut.await.map_err(Error::sub_rlm)?;

        {
            let mut cache = parent.cache.lock().await;
            cache.insert(fingerprint.clone(), outcome.final_value.clone());
        }

        Ok(SubCallResult {
            final_value: outcome.final_value,
            cached: false,
            fingerprint,
        })
    }

    /// `sub_map`'s fan-out: up to `concurrency` sub-calls in flight at
    /// once, results collected in input order regardless of completion
    /// order (`join_all` preserves the order of the futures it was given).
    pub async fn dispatch_map(
        &self,
        parent: &Environment,
        query_template: &str,
        items: Vec<String>,
        concurrency: usize,
    ) -> Result<Vec<SubCallResult>> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let futures = items.into_iter().map(|item| {
            let semaphore = semaphore.clone();
            let query = query_template.replace("{{item}}", &item);
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                self.dispatch(parent, &query, None, None).await
            }
        });
        futures::future::join_all(futures)
            .await
            .into_iter()
            .collect()
    }
}
