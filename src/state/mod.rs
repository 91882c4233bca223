//! State management module
//!
//! This module handles all library state:
//! - Shared data structures (data.rs)
//! - Durable, observable key-value storage (store.rs)
//! - The folder/image mutation API on top of it (library.rs)

pub mod data;
pub mod library;
pub mod store;
