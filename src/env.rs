//! Per-root or per-child runtime state: the `Environment` the Action
//! Interpreter mutates and the Root Loop drives to `final`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::budget::{Budget, BudgetLimits};
use crate::docstore::DocumentStore;
use crate::error::Result;
use crate::fingerprint::fingerprint_str;
use crate::scratch::Scratch;
use crate::trace::Trace;

/// Cache of sub-call fingerprint -> final string, shared by reference
/// across a whole root tree.
pub type SharedCache = Arc<Mutex<HashMap<String, String>>>;

/// The payload an [`ExternalSymbol`] receives for a `call_symbol` action.
#[derive(Debug, Clone)]
pub struct SymbolCall {
    pub symbol: String,
    pub prompt: String,
    pub prompt_id: String,
    pub depth: u32,
    pub scratch: serde_json::Map<String, Value>,
    pub args: Option<Value>,
    pub input: Option<Value>,
}

/// An externally supplied function `call_symbol` can invoke. Also used by
/// the Planned Executor to wire objective/constraint metric readers.
#[async_trait]
pub trait ExternalSymbol: Send + Sync {
    async fn call(&self, call: SymbolCall) -> Result<Value>;
}

/// A symbol table keyed by name, looked up by `call_symbol`.
pub type SymbolTable = HashMap<String, Arc<dyn ExternalSymbol>>;

/// Per-environment runtime state: scratch memory, document access, budget,
/// trace, and the terminal `final` slot.
pub struct Environment {
    pub prompt: String,
    pub prompt_id: String,
    pub doc_store: Arc<dyn DocumentStore>,
    pub scratch: Scratch,
    pub cache: SharedCache,
    pub budget: Budget,
    pub trace: Trace,
    pub final_value: Option<String>,
    pub depth: u32,
    /// Correlation id for logging only; never placed in trace previews or
    /// LM messages.
    pub id: Uuid,
}

impl Environment {
    /// Construct a root environment. `prompt_id` is the prompt's
    /// fingerprint; stable across a run for the same prompt text.
    pub fn new_root(prompt: String, doc_store: Arc<dyn DocumentStore>, limits: BudgetLimits) -> Self {
        let prompt_id = fingerprint_str(&prompt);
        Self {
            prompt,
            prompt_id,
            doc_store,
            scratch: Scratch::new(),
            cache: Arc::new(Mutex::new(HashMap::new())),
            budget: Budget::new(limits),
            trace: Trace::new(),
            final_value: None,
            depth: 0,
            id: Uuid::new_v4(),
        }
    }

    /// Construct a child environment for a sub-RLM call. Inherits `cache`
    /// by reference and derives its budget from the parent's.
    pub fn new_child(
        parent: &Environment,
        prompt: String,
        doc_store: Arc<dyn DocumentStore>,
        budget_overrides: Option<BudgetLimits>,
    ) -> Self {
        let prompt_id = fingerprint_str(&prompt);
        Self {
            prompt,
            prompt_id,
            doc_store,
            scratch: Scratch::new(),
            cache: parent.cache.clone(),
            budget: parent.budget.child(budget_overrides),
            trace: Trace::new(),
            final_value: None,
            depth: parent.depth + 1,
            id: Uuid::new_v4(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.final_value.is_some()
    }
}
