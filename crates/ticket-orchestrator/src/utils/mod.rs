//! Utilities module - text helpers and bounded collections

pub mod bounded_list;
pub mod text_utils;

pub use bounded_list::BoundedList;
pub use text_utils::TextUtils;
