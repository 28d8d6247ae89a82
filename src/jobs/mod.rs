//! Job lifecycle: the record state machine, the submission path, and the
//! worker-side runner that drives one queued task to a terminal state.

pub mod runner;
pub mod state;
pub mod submit;

pub use runner::{Begin, ExecutionReport, JobRunner};
pub use state::{JobRecord, JobStatus, JobUpdate, TransitionOutcome};
pub use submit::JobSubmitter;
