mod json;

pub use json::JsonCheckpoint;
