//! SSTable-like table builder/reader and footer (spec.md §4.1–§4.2).

pub mod builder;
pub mod footer;
pub mod reader;

pub use builder::TableBuilder;
pub use footer::{BlockHandle, Footer};
pub use reader::TableReader;
