//! Append-only execution trace.
//!
//! Traces use bounded-size previews (default 200 chars) so they never
//! retain full document bodies, matching the privacy property in the
//! testable-properties section of the spec. One environment's trace is
//! never merged with a child's; only the sub-call summary surfaces.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default preview length for trace content, in chars.
pub const DEFAULT_PREVIEW_LEN: usize = 200;

/// Truncate `s` to at most `max_len` chars, appending an ellipsis marker
/// when truncated.
pub fn preview(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_len).collect();
    format!("{truncated}…")
}

/// One entry in an environment's trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    /// Emitted once per Root Loop turn.
    RootStep {
        step: u64,
        prompt_preview: String,
        stdout_preview: Option<String>,
        lm_usage: Option<Value>,
    },
    /// Emitted after each action execution.
    ReplExec {
        action: String,
        stdout_preview: String,
        scratch_keys: Vec<String>,
    },
    /// Emitted by the sub-RLM dispatcher for every sub-call, hit or miss.
    SubCall {
        cached: bool,
        fingerprint: String,
        result_preview: String,
    },
}

/// An append-only, ordered trace for one environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn push_root_step(
        &mut self,
        step: u64,
        prompt: &str,
        stdout: Option<&str>,
        lm_usage: Option<Value>,
    ) {
        self.push(TraceEvent::RootStep {
            step,
            prompt_preview: preview(prompt, DEFAULT_PREVIEW_LEN),
            stdout_preview: stdout.map(|s| preview(s, DEFAULT_PREVIEW_LEN)),
            lm_usage,
        });
    }

    pub fn push_repl_exec(&mut self, action: &str, stdout: &str, scratch_keys: Vec<String>) {
        self.push(TraceEvent::ReplExec {
            action: action.to_string(),
            stdout_preview: preview(stdout, DEFAULT_PREVIEW_LEN),
            scratch_keys,
        });
    }

    pub fn push_sub_call(&mut self, cached: bool, fingerprint: &str, result: &str) {
        self.push(TraceEvent::SubCall {
            cached,
            fingerprint: fingerprint.to_string(),
            result_preview: preview(result, DEFAULT_PREVIEW_LEN),
        });
    }

    /// Count of `sub_call` events with `cached == true`.
    pub fn cached_sub_call_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, TraceEvent::SubCall { cached: true, .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_long_strings() {
        let long = "x".repeat(300);
        let p = preview(&long, DEFAULT_PREVIEW_LEN);
        assert_eq!(p.chars().count(), DEFAULT_PREVIEW_LEN + 1);
        assert!(p.ends_with('…'));
    }

    #[test]
    fn preview_keeps_short_strings_intact() {
        assert_eq!(preview("short", DEFAULT_PREVIEW_LEN), "short");
    }

    #[test]
    fn trace_is_append_only_and_ordered() {
        let mut trace = Trace::new();
        trace.push_root_step(1, "prompt meta", None, None);
        trace.push_repl_exec("prompt_meta", "{}", vec!["doc".into()]);
        trace.push_sub_call(false, "abc123", "final answer");
        trace.push_sub_call(true, "abc123", "final answer");

        assert_eq!(trace.len(), 4);
        assert_eq!(trace.cached_sub_call_count(), 1);
        match &trace.events()[0] {
            TraceEvent::RootStep { step, .. } => assert_eq!(*step, 1),
            _ => panic!("expected root_step first"),
        }
    }
}
