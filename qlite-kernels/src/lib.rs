//! Reference float kernels and quantization arithmetic for the `qlite` compiler.
//!
//! Nothing here is tuned: the kernels exist so graphs can be executed on the
//! host while tracing, calibrating and checking converted models.

pub mod kernels;

pub use kernels::quant::{QRange, Rounding};
