pub mod helpers;

pub use helpers::{format_time, presence_label, presence_label_at};
