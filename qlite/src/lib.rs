//! Quantization-aware tracing and TFLite conversion.
//!
//! An eager [`nn::Module`] is traced into an IR [`ir::Graph`], rewritten for
//! quantization-aware training by [`QatQuantizer`], optimized, and written as a
//! TFLite flatbuffer by [`TfliteConverter`].

pub mod convert;
pub mod error;
pub mod ir;
pub mod nn;
pub mod optimize;
pub mod parse;
pub mod quant;
pub mod registry;
pub mod tensor;
pub mod trace;

pub use convert::{convert_graph, ConverterOptions, QuantizedElementType, TfliteConverter};
pub use error::{Error, Result};
pub use parse::tflite::read_model;
pub use quant::{quantize, QatQuantizer, QuantConfig};
pub use tensor::HostTensor;
pub use trace::trace;
