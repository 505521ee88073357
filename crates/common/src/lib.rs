// trellis-common: shared protocol and document model for the Trellis workspace

pub mod order;
pub mod protocol;
pub mod query;
pub mod types;
