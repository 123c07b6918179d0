//! Canonical trace topic constants shared by the vat runtime and the server.
//!
//! Keep this list alphabetized within sections and favor dot.case names.

// Messages
pub const TOPIC_MSG_GOT: &str = "amp.msg.got";
pub const TOPIC_MSG_SENT: &str = "amp.msg.sent";

// Calls served
pub const TOPIC_CALL_EXECUTED: &str = "amp.call.executed";
pub const TOPIC_CALL_REPLAYED: &str = "amp.call.replayed";

// Pipelines
pub const TOPIC_PIPELINE_HALTED: &str = "amp.pipeline.halted";
pub const TOPIC_PIPELINE_RESTARTED: &str = "amp.pipeline.restarted";

// Vat lifecycle
pub const TOPIC_TURN_ABORTED: &str = "amp.turn.aborted";
pub const TOPIC_VAT_REVIVED: &str = "amp.vat.revived";

/// Every topic above, for subscribers that persist the full trace.
pub const ALL: &[&str] = &[
    TOPIC_MSG_GOT,
    TOPIC_MSG_SENT,
    TOPIC_CALL_EXECUTED,
    TOPIC_CALL_REPLAYED,
    TOPIC_PIPELINE_HALTED,
    TOPIC_PIPELINE_RESTARTED,
    TOPIC_TURN_ABORTED,
    TOPIC_VAT_REVIVED,
];
