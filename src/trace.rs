//! W3C traceparent contexts correlating a run's tasks.
//!
//! A root context is created once per orchestrator run; each linter task
//! gets a child context sharing the trace id with a fresh span id. The
//! header format is the traceparent shape `00-{trace}-{span}-{flags}`.

use serde::{Deserialize, Serialize};

/// Correlation identifiers for one unit of work.
///
/// Immutable after creation; `trace_id` is 32 lowercase hex characters,
/// `span_id` is 16.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub sampled: bool,
}

impl TraceContext {
    /// Create a root context with fresh random identifiers, sampled.
    pub fn root() -> Self {
        Self::root_with_sampling(true)
    }

    /// Create a root context with an explicit sampling flag.
    pub fn root_with_sampling(sampled: bool) -> Self {
        Self {
            trace_id: random_hex_128(),
            span_id: random_hex_64(),
            parent_span_id: None,
            sampled,
        }
    }

    /// Create a child context: same trace id, new span id, this span as
    /// parent, sampling flag copied.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: random_hex_64(),
            parent_span_id: Some(self.span_id.clone()),
            sampled: self.sampled,
        }
    }

    /// Render the traceparent header: `00-{trace_id}-{span_id}-{01|00}`.
    pub fn traceparent(&self) -> String {
        format!(
            "00-{}-{}-{}",
            self.trace_id,
            self.span_id,
            if self.sampled { "01" } else { "00" }
        )
    }

    /// Parse a traceparent header back into a context.
    ///
    /// Returns `None` for a wrong segment count, a version byte other than
    /// `00`, wrong identifier lengths, or non-hex identifiers. Never panics.
    pub fn parse_traceparent(header: &str) -> Option<Self> {
        let parts: Vec<&str> = header.split('-').collect();
        if parts.len() != 4 {
            return None;
        }
        let (version, trace_id, span_id, flags) = (parts[0], parts[1], parts[2], parts[3]);
        if version != "00" {
            return None;
        }
        if trace_id.len() != 32 || !is_lower_hex(trace_id) {
            return None;
        }
        if span_id.len() != 16 || !is_lower_hex(span_id) {
            return None;
        }
        if flags.len() != 2 || !is_lower_hex(flags) {
            return None;
        }
        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            parent_span_id: None,
            sampled: flags == "01",
        })
    }
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

// All-zero identifiers are invalid in the traceparent format.
fn random_hex_128() -> String {
    loop {
        let v: u128 = rand::random();
        if v != 0 {
            return format!("{v:032x}");
        }
    }
}

fn random_hex_64() -> String {
    loop {
        let v: u64 = rand::random();
        if v != 0 {
            return format!("{v:016x}");
        }
    }
}
