//! Lead records and contact-identifier normalization.

pub mod model;
pub mod normalize;

pub use model::{Lead, LeadType, NewLead, SequenceStatus, Temperature};
pub use normalize::{normalize_email, normalize_phone};
