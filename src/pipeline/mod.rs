//! Ingestion pipeline.
//!
//! Raw mail from a `MailboxClient` flows through:
//! 1. `IntakeRules::evaluate()`: drop our own mail, bounces and no-reply senders
//! 2. `sanitizer::clean_body()`: strip signatures and quoted replies
//! 3. `thread::classify()`: new ticket or reply to `[#TKT-…]`
//! 4. `IngestionEngine`: customer lookup, ticket writes, notifications
//!
//! `scheduler` runs the engine on an interval with graceful shutdown.

pub mod engine;
pub mod rules;
pub mod sanitizer;
pub mod scheduler;
pub mod thread;

pub use engine::{
    CycleOutcome, CycleReport, Disposition, EngineSettings, EngineState, IngestionEngine,
    MessageFailure, ProcessedMessage, Stage,
};
pub use rules::IntakeRules;
pub use scheduler::{ShutdownHandle, ShutdownSignal, shutdown_channel, spawn_ingestion_worker};
pub use thread::{ThreadDecision, classify, reply_subject};
