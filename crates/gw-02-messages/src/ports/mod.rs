//! Ports: the conversion contract between chain modules and the pipeline.

pub mod converter;

pub use converter::{BlockConversionResult, BlockConverter, BlockInfo, SHORT_ID_INDICATOR};
