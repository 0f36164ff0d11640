pub mod json;
pub mod plain;

pub use json::{output_json, save_json};
pub use plain::output_plain;
