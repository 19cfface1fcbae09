//! Pure merge of configuration layers.

pub mod service;

pub use service::{merge_layers, MergeService, MergedSettings};
