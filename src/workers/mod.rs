//! Background workers
//!
//! Tasks that take finished recordings out of the pipeline.

pub mod export;

pub use export::{LogUploadSink, UploadSink, export_path, save_artifact};
