pub mod error;
pub mod host_id;
pub mod path;
