//! Upload module
//!
//! This module handles:
//! - Decoding and shrinking incoming images (normalize.rs)
//! - Talking to the background removal service (remover.rs)
//! - Driving one upload from file to processed library image (pipeline.rs)

pub mod normalize;
pub mod pipeline;
pub mod remover;
