//! TFLite flatbuffer schema and reader.

mod reader;
pub mod schema;

pub use reader::read_model;
