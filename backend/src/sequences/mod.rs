// Sequence Automation Engine
//
// Event-driven patient-communication workflows: triggers create runs,
// the worker executes them step by step with a durable checkpoint, and
// the dispatcher delivers message steps through the channel providers.

pub mod dispatcher;
pub mod model;
pub mod templates;
pub mod triggers;
pub mod worker;

pub use dispatcher::MessageDispatcher;
pub use model::{
    decode_steps, MessageChannel, RunStatus, Sequence, SequenceRun, SequenceStatus, SequenceStep,
};
pub use templates::MergeContext;
pub use triggers::{TriggerService, TriggerTarget};
pub use worker::{refresh_sequence_stats, SequenceWorker};
