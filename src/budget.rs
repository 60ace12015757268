//! Resource budget for a single RLM environment.
//!
//! Counters are monotone: no operation ever decreases them. A breach raises
//! [`Error::BudgetExceeded`] before any further accounting happens for that
//! call. Counters use atomics because `sub_map` may dispatch several
//! concurrent sub-calls against the same parent environment's budget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BudgetKind, Error, Result};

/// Configuration limits for a [`Budget`]. Serializable so a host can load
/// overrides from its own configuration layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetLimits {
    pub max_steps: u64,
    pub max_sub_calls: u64,
    pub max_depth: u32,
    pub max_prompt_read_chars: u64,
    pub max_time_ms: u64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_steps: 32,
            max_sub_calls: 32,
            max_depth: 4,
            max_prompt_read_chars: 200_000,
            max_time_ms: 30_000,
        }
    }
}

impl BudgetLimits {
    pub fn with_max_steps(mut self, v: u64) -> Self {
        self.max_steps = v;
        self
    }

    pub fn with_max_sub_calls(mut self, v: u64) -> Self {
        self.max_sub_calls = v;
        self
    }

    pub fn with_max_depth(mut self, v: u32) -> Self {
        self.max_depth = v;
        self
    }

    pub fn with_max_prompt_read_chars(mut self, v: u64) -> Self {
        self.max_prompt_read_chars = v;
        self
    }

    pub fn with_max_time_ms(mut self, v: u64) -> Self {
        self.max_time_ms = v;
        self
    }
}

/// Point-in-time snapshot of budget consumption, for host-side reporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub limits: BudgetLimits,
    pub steps_used: u64,
    pub sub_calls_used: u64,
    pub depth: u32,
    pub prompt_read_chars_used: u64,
    pub elapsed_ms: u64,
    /// Wall-clock start of the root tree this budget belongs to, for host
    /// logging/reporting. Not consulted by any budget check, which uses
    /// the monotonic clock below instead.
    pub started_at: DateTime<Utc>,
}

/// Resource budget for one RLM environment.
///
/// A child environment's budget is created via [`Budget::child`]: it
/// inherits `max_depth` and `started_at` from the parent (time budget is
/// shared across the whole root tree's clock) and gets fresh usage
/// counters, while other limits may be overridden by the caller.
pub struct Budget {
    limits: BudgetLimits,
    steps_used: AtomicU64,
    sub_calls_used: AtomicU64,
    depth: u32,
    prompt_read_chars_used: AtomicU64,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
}

impl Budget {
    /// Create a root budget with the given limits, clock starting now.
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            steps_used: AtomicU64::new(0),
            sub_calls_used: AtomicU64::new(0),
            depth: 0,
            prompt_read_chars_used: AtomicU64::new(0),
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
        }
    }

    /// Derive a child budget for a sub-RLM call. `depth = self.depth + 1`;
    /// `max_depth` and `started_at` are inherited; other limits default to
    /// `self.limits` unless `overrides` replaces them.
    pub fn child(&self, overrides: Option<BudgetLimits>) -> Self {
        let mut limits = overrides.unwrap_or(self.limits);
        limits.max_depth = self.limits.max_depth;
        Self {
            limits,
            steps_used: AtomicU64::new(0),
            sub_calls_used: AtomicU64::new(0),
            depth: self.depth + 1,
            prompt_read_chars_used: AtomicU64::new(0),
            started_at: self.started_at,
            started_at_utc: self.started_at_utc,
        }
    }

    pub fn limits(&self) -> BudgetLimits {
        self.limits
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn steps_used(&self) -> u64 {
        self.steps_used.load(Ordering::Relaxed)
    }

    pub fn sub_calls_used(&self) -> u64 {
        self.sub_calls_used.load(Ordering::Relaxed)
    }

    pub fn prompt_read_chars_used(&self) -> u64 {
        self.prompt_read_chars_used.load(Ordering::Relaxed)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    fn check_time(&self) -> Result<()> {
        let elapsed = self.elapsed_ms();
        if elapsed >= self.limits.max_time_ms {
            return Err(Error::budget_exceeded(
                BudgetKind::MaxTimeMs,
                self.limits.max_time_ms,
                elapsed,
            ));
        }
        Ok(())
    }

    /// Account one more step. Time is checked first, per spec ("Time check
    /// is performed before any accounting step").
    pub fn consume_step(&self) -> Result<()> {
        self.check_time()?;
        let used = self.steps_used.fetch_add(1, Ordering::Relaxed) + 1;
        if used > self.limits.max_steps {
            return Err(Error::budget_exceeded(
                BudgetKind::MaxSteps,
                self.limits.max_steps,
                used,
            ));
        }
        Ok(())
    }

    /// Account one more sub-call.
    pub fn consume_sub_call(&self) -> Result<()> {
        self.check_time()?;
        let used = self.sub_calls_used.fetch_add(1, Ordering::Relaxed) + 1;
        if used > self.limits.max_sub_calls {
            return Err(Error::budget_exceeded(
                BudgetKind::MaxSubCalls,
                self.limits.max_sub_calls,
                used,
            ));
        }
        Ok(())
    }

    /// Check (without incrementing) that a child at `depth + 1` would be
    /// within `max_depth`. The child environment itself holds the new
    /// depth once constructed.
    pub fn ensure_next_depth(&self) -> Result<()> {
        self.check_time()?;
        let next = self.depth as u64 + 1;
        if next > self.limits.max_depth as u64 {
            return Err(Error::budget_exceeded(
                BudgetKind::MaxDepth,
                self.limits.max_depth as u64,
                next,
            ));
        }
        Ok(())
    }

    /// Account `n` characters read from the prompt. A non-positive `n` is a
    /// no-op (slices with `start == end`, etc).
    pub fn consume_prompt_chars(&self, n: i64) -> Result<()> {
        if n <= 0 {
            return Ok(());
        }
        self.check_time()?;
        let used = self
            .prompt_read_chars_used
            .fetch_add(n as u64, Ordering::Relaxed)
            + n as u64;
        if used > self.limits.max_prompt_read_chars {
            return Err(Error::budget_exceeded(
                BudgetKind::MaxPromptReadChars,
                self.limits.max_prompt_read_chars,
                used,
            ));
        }
        Ok(())
    }

    pub fn status(&self) -> BudgetStatus {
        BudgetStatus {
            limits: self.limits,
            steps_used: self.steps_used(),
            sub_calls_used: self.sub_calls_used(),
            depth: self.depth,
            prompt_read_chars_used: self.prompt_read_chars_used(),
            elapsed_ms: self.elapsed_ms(),
            started_at: self.started_at_utc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> BudgetLimits {
        BudgetLimits::default()
            .with_max_steps(2)
            .with_max_sub_calls(2)
            .with_max_depth(1)
            .with_max_prompt_read_chars(10)
            .with_max_time_ms(60_000)
    }

    #[test]
    fn steps_exceeded() {
        let b = Budget::new(limits());
        assert!(b.consume_step().is_ok());
        assert!(b.consume_step().is_ok());
        let err = b.consume_step().unwrap_err();
        assert!(matches!(
            err,
            Error::BudgetExceeded {
                kind: BudgetKind::MaxSteps,
                ..
            }
        ));
        assert_eq!(b.steps_used(), 3);
    }

    #[test]
    fn sub_calls_exceeded() {
        let b = Budget::new(limits());
        assert!(b.consume_sub_call().is_ok());
        assert!(b.consume_sub_call().is_ok());
        assert!(b.consume_sub_call().is_err());
    }

    #[test]
    fn depth_check_does_not_increment() {
        let b = Budget::new(limits());
        assert!(b.ensure_next_depth().is_ok());
        let child = b.child(None);
        assert_eq!(child.depth(), 1);
        assert!(child.ensure_next_depth().is_err());
    }

    #[test]
    fn prompt_chars_zero_and_negative_are_noop() {
        let b = Budget::new(limits());
        assert!(b.consume_prompt_chars(0).is_ok());
        assert!(b.consume_prompt_chars(-5).is_ok());
        assert_eq!(b.prompt_read_chars_used(), 0);
    }

    #[test]
    fn prompt_chars_exceeded() {
        let b = Budget::new(limits());
        assert!(b.consume_prompt_chars(8).is_ok());
        assert!(b.consume_prompt_chars(5).is_err());
    }

    #[test]
    fn child_inherits_max_depth_and_clock() {
        let parent = Budget::new(limits());
        let child = parent.child(Some(
            BudgetLimits::default().with_max_steps(99).with_max_depth(99),
        ));
        // max_depth is always inherited from the parent, override is ignored.
        assert_eq!(child.limits().max_depth, 1);
        assert_eq!(child.limits().max_steps, 99);
        assert_eq!(child.depth(), 1);
    }

    #[test]
    fn counters_never_decrease() {
        let b = Budget::new(BudgetLimits::default());
        b.consume_step().unwrap();
        b.consume_step().unwrap();
        let used = b.steps_used();
        assert_eq!(used, 2);
    }
}
