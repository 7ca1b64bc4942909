pub mod entity;
pub mod invariants;

pub use entity::ClientRecord;
pub use invariants::validate_client;
