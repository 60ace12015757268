//! # rlm-runtime
//!
//! A runtime for Recursive Language Models (RLM): a controller that solves
//! document-oriented tasks by driving a language model through a tiny JSON
//! step-language, keeping the bulk document out of the LM's chat context.
//!
//! ## Core Components
//!
//! - **Budget**: step/subcall/depth/char/time accounting, fail-fast on breach
//! - **DocumentStore**: abstract read-all/read-slice document access
//! - **StructuredDocument**: in-memory IR for text/markdown/CSV
//! - **ActionInterpreter**: executes one DSL action against an environment
//! - **SubRLMDispatcher**: cached, budget-checked recursive child RLM calls
//! - **RootLoop**: the LM-environment turn cycle, coercion, early-stop
//! - **Planner** / **PlannedExecutor**: turns a user request into a Plan
//!   and dispatches it to the Root Loop or the Long-Run Loop
//! - **ImprovementLoop** / **LongRunLoop**: metric-gated candidate
//!   evaluation for iterated optimization tasks
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rlm_runtime::{Environment, RootLoop, RootLoopConfig, TestLMProvider, InMemoryDocumentStore};
//!
//! # async fn run() -> rlm_runtime::Result<()> {
//! let lm = Arc::new(TestLMProvider::new([
//!     r#"{"op":"set","path":"answer","value":"ok"}"#,
//!     r#"{"op":"finalize","from":"answer"}"#,
//! ]));
//! let doc_store = Arc::new(InMemoryDocumentStore::single("doc", "hello world"));
//! let env = Environment::new_root("hello world".to_string(), doc_store, Default::default());
//! let root_loop = RootLoop::new(lm, RootLoopConfig::default(), Default::default());
//! let outcome = root_loop.run(env, "say ok".to_string()).await?;
//! assert_eq!(outcome.final_value, "ok");
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod budget;
pub mod dispatcher;
pub mod docstore;
pub mod document;
pub mod env;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod improvement;
pub mod interpreter;
pub mod llm;
pub mod long_run;
pub mod planner;
pub mod root_loop;
pub mod scratch;
pub mod trace;

pub use action::{coerce_action, parse_action, Action, ColumnArg};
pub use budget::{Budget, BudgetLimits, BudgetStatus};
pub use dispatcher::{SubCallResult, SubRLMDispatcher};
pub use docstore::{DocumentStore, InMemoryDocumentStore, RemoteDocumentStore, RemoteReadFn};
pub use document::{
    compare_cell, detect_format, filter_rows, find_section, parse_structured_document,
    project_columns, resolve_column, sum_column, ColumnRef, Comparator, Format, MarkdownSection,
    ParseOptions, Projection, StructuredDocument,
};
pub use env::{Environment, ExternalSymbol, SharedCache, SymbolCall, SymbolTable};
pub use error::{BudgetKind, Error, Result};
pub use executor::{ExecutionOutcome, LongRunInputs, PlannedExecutor, ProfileDefaults};
pub use fingerprint::{fingerprint_json, fingerprint_str};
pub use improvement::{
    best_accepted, run_improvement_loop, score_snapshot, CandidateResult, Evaluator,
    MetricSnapshot, Policy,
};
pub use interpreter::ActionInterpreter;
pub use llm::{
    action_response_format, plan_response_format, ChatMessage, ClientConfig, CompletionOptions,
    Completion, HttpChatCompletionsProvider, JsonSchemaSpec, LMProvider, ResponseFormat, Role,
    TestLMProvider, Usage,
};
pub use long_run::{run_long_run_loop, CandidateGenerator, LongRunContext, LongRunOutcome};
pub use planner::{
    Constraint, ConstraintComparator, ConstraintSource, Direction, LongRunSpec, Objective, Plan,
    PlanMode, Planner, Profile,
};
pub use root_loop::{RootLoop, RootLoopConfig, RootLoopOutcome};
pub use scratch::Scratch;
pub use trace::{Trace, TraceEvent};
