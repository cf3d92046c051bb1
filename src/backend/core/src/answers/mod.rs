//! Answer ingestion.
//!
//! - **`intake`**: validates a submission against the question's round state and
//!   hands back a provisional answer without touching storage.
//! - **`buffer`**: the concurrent queue behind the intake, flushed to the entity
//!   store in periodic batches.
//!
//! Delivery to storage is at-most-once. A batch whose bulk write fails is
//! logged and dropped, never re-queued, which keeps memory bounded by one
//! flush interval of traffic.

pub mod buffer;
pub mod intake;

pub use buffer::{AnswerBuffer, BufferStats, FlushOutcome, FlushPause};
pub use intake::AnswerIntake;
