pub mod entity;
pub mod invariants;

pub use entity::FileRecord;
pub use invariants::validate_file;
