//! Core build machinery.
//!
//! - State: typed container shared by all steps
//! - Step: the unit of work and its cleanup contract
//! - Runner: sequential execution with reverse-order cleanup
//! - Poll: waiting on asynchronous remote transitions
//! - Assembler: final state to build outcome
//! - Orchestrator: the image builder tying it together

pub mod assembler;
pub mod orchestrator;
pub mod poll;
pub mod runner;
pub mod state;
pub mod step;

pub use assembler::{assemble, BuildOutcome};
pub use orchestrator::{BuildReport, ImageBuilder};
pub use poll::{wait_for, PollPolicy, Probe};
pub use runner::Runner;
pub use state::{StateBag, StateKey, StateValue};
pub use step::{halt, Step, StepAction};
