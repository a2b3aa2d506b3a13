pub mod ingest;
pub mod integrity;
pub mod model;
pub mod register;
pub mod retention;
pub mod store;
pub mod versions;
pub mod workflow;

pub use store::EvidenceStore;
