//! Timed follow-up sequences.

pub mod model;
pub mod runner;
pub mod template;

pub use model::{EnrollmentStatus, Sequence, SequenceEnrollment, SequenceStep, StopReason};
pub use runner::{EnrollmentTickReport, SequenceRunner, StartOutcome, StepOutcome};
pub use template::{TemplateVars, render};
