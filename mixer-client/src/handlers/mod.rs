pub mod commitments;
pub mod public;
