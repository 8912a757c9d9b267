//! Accumulation of server errors and warnings for one unit of work.

use tds_protocol::token::ServerMessage;

use crate::error::ServerErrors;

/// Ordered errors and warnings reported by the server.
///
/// Messages are kept in receipt order. Errors and warnings seen before an
/// attention are parked so the timeout error reported afterwards comes
/// first in the consolidated collection.
#[derive(Debug, Clone, Default)]
pub struct ErrorWarningsState {
    errors: Vec<ServerMessage>,
    warnings: Vec<ServerMessage>,
    pre_attention_errors: Vec<ServerMessage>,
    pre_attention_warnings: Vec<ServerMessage>,
    pending_info_events: Vec<ServerMessage>,
    accumulate_info_events: bool,
    has_fatal_error: bool,
}

impl ErrorWarningsState {
    /// Record an error.
    pub fn add_error(&mut self, error: ServerMessage) {
        if error.is_fatal() {
            self.has_fatal_error = true;
        }
        self.errors.push(error);
    }

    /// Record a warning.
    pub fn add_warning(&mut self, warning: ServerMessage) {
        self.warnings.push(warning);
    }

    /// Queue an informational message for the listener.
    pub fn add_info_event(&mut self, info: ServerMessage) {
        self.pending_info_events.push(info);
    }

    /// Take the queued informational messages.
    pub fn take_pending_info_events(&mut self) -> Vec<ServerMessage> {
        std::mem::take(&mut self.pending_info_events)
    }

    /// Whether informational messages are held back instead of flushed.
    #[must_use]
    pub fn accumulate_info_events(&self) -> bool {
        self.accumulate_info_events
    }

    /// Hold informational messages back until accumulation is turned off.
    pub fn set_accumulate_info_events(&mut self, accumulate: bool) {
        self.accumulate_info_events = accumulate;
    }

    /// Whether a fatal-severity error was recorded.
    #[must_use]
    pub fn has_fatal_error(&self) -> bool {
        self.has_fatal_error
    }

    /// Whether anything would be reported.
    #[must_use]
    pub fn has_errors_or_warnings(&self) -> bool {
        !self.errors.is_empty()
            || !self.warnings.is_empty()
            || !self.pre_attention_errors.is_empty()
            || !self.pre_attention_warnings.is_empty()
    }

    /// Errors recorded since the last attention.
    #[must_use]
    pub fn errors(&self) -> &[ServerMessage] {
        &self.errors
    }

    /// Warnings recorded since the last attention.
    #[must_use]
    pub fn warnings(&self) -> &[ServerMessage] {
        &self.warnings
    }

    /// Park current errors and warnings before sending an attention.
    pub fn store_pre_attention(&mut self) {
        self.pre_attention_errors.append(&mut self.errors);
        self.pre_attention_warnings.append(&mut self.warnings);
    }

    /// Errors, warnings, pre-attention errors, pre-attention warnings.
    #[must_use]
    pub fn full_collection(&self) -> Vec<ServerMessage> {
        self.errors
            .iter()
            .chain(&self.warnings)
            .chain(&self.pre_attention_errors)
            .chain(&self.pre_attention_warnings)
            .cloned()
            .collect()
    }

    /// Take everything recorded as one consolidated collection.
    ///
    /// The fatal flag survives; it describes the session, not the batch.
    pub fn take_all(&mut self) -> ServerErrors {
        let messages = self.full_collection();
        self.errors.clear();
        self.warnings.clear();
        self.pre_attention_errors.clear();
        self.pre_attention_warnings.clear();
        ServerErrors::new(messages)
    }
}
