//! Small, dependency-light helpers shared across the orchestration subsystems.

pub mod json_ext;

pub use json_ext::{
    deep_merge, deserialize_with_context, get_by_path, serialize_with_context, JsonError,
    JsonSerializable, JsonValueExt, MergeStrategy,
};
