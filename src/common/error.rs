//! Pass errors and the diagnostic log.
//!
//! Two severities exist and they do not mix:
//!
//! - `InstrumentError` is fatal. Every variant is a programmer error or a
//!   planner bug: the pass aborts immediately, and the message names the
//!   offending function and renders the offending operand.
//! - Non-fatal diagnostics (unsupported pointer shapes, killed-metadata
//!   reloads) accumulate in a `DiagnosticLog` while instrumentation
//!   continues conservatively. The log is flushed to stderr once, after the
//!   whole module has been produced.

use thiserror::Error;

/// A fatal instrumentation failure. These abort the pass.
#[derive(Debug, Error)]
pub enum InstrumentError {
    /// An operand was found in both the block-scoped and function-scoped
    /// metadata tables. The tables are mutually exclusive by construction.
    #[error("in `{function}`: {operand} is present in both the block-scoped and function-scoped metadata tables")]
    ScopeConflict { function: String, operand: String },

    /// The rewriter needed shadow storage for an operand the planner never
    /// allocated cells for.
    #[error("in `{function}`: no shadow storage was planned for {operand}")]
    MissingShadowStorage { function: String, operand: String },

    /// A non-pointer operand reached a routine that only accepts pointers.
    #[error("in `{function}`: {operand} of type {ty} passed to a pointer-only routine")]
    NotAPointer {
        function: String,
        operand: String,
        ty: String,
    },
}

/// Accumulates non-fatal diagnostics during a pass over one module.
///
/// Diagnostics are deliberately not printed as they occur; the pass is
/// deterministic and the log is flushed in one block after the module has
/// been emitted, so interleaving with other output cannot reorder it.
#[derive(Debug, Default)]
pub struct DiagnosticLog {
    entries: Vec<String>,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one diagnostic line.
    pub fn record(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::trace!("diagnostic: {}", message);
        self.entries.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Write all accumulated diagnostics to stderr and clear the log.
    pub fn flush_to_stderr(&mut self) {
        for entry in self.entries.drain(..) {
            eprintln!("softboundcets: {}", entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_accumulates_in_order() {
        let mut log = DiagnosticLog::new();
        assert!(log.is_empty());
        log.record("first");
        log.record(String::from("second"));
        assert_eq!(log.entries(), &["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_error_messages_name_function_and_operand() {
        let err = InstrumentError::ScopeConflict {
            function: "f".to_string(),
            operand: "%3".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("`f`"));
        assert!(msg.contains("%3"));
    }
}
