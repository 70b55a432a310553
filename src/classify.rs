//! Response classifier — routes an NLU analysis result.
//!
//! Pure function over an [`AnalysisResult`]; the only side effect is
//! logging. Evaluated in strict precedence order, first match wins: an
//! unknown intent with an empty action must not be misrouted into a
//! stalled incomplete state.

use crate::nlu::{AnalysisResult, UNKNOWN_ACTION};

/// Prefix marking actions that require a yes/no confirmation sub-flow
/// before they are dispatched.
pub const CONFIRM_PREFIX: &str = "confirm.";

/// Outcome of classifying one analysis result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// No intent matched; reply with the backend's fallback utterance.
    Unknown { speech: String },
    /// A named action with all required slots filled; hand off to the
    /// dispatcher.
    ActionPending { action: String },
    /// Required slots are still missing; reply with the backend's
    /// follow-up question.
    Incomplete { speech: String },
    /// Nothing special; reply with the fulfillment utterance as-is.
    Fulfillment { speech: String },
}

/// Classify an analysis result.
pub fn classify(result: &AnalysisResult) -> Classification {
    if result.action == UNKNOWN_ACTION {
        tracing::debug!(query = %result.resolved_query, "unknown intent");
        return Classification::Unknown {
            speech: result.fulfillment.speech.clone(),
        };
    }

    if !result.action.is_empty() && !result.action_incomplete {
        tracing::debug!(action = %result.action, "action pending");
        return Classification::ActionPending {
            action: result.action.clone(),
        };
    }

    if result.action_incomplete {
        tracing::info!(speech = %result.fulfillment.speech, "incomplete, slot filling");
        return Classification::Incomplete {
            speech: result.fulfillment.speech.clone(),
        };
    }

    Classification::Fulfillment {
        speech: result.fulfillment.speech.clone(),
    }
}
