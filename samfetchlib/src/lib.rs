//! Acquisition of firmware images from the Samsung update infrastructure.
//!
//! The entry point is [`acquire::AcquisitionOrchestrator`]. The other modules
//! can be used on their own.

pub mod acquire;
pub mod auth;
mod central;
pub mod crypto;
pub mod file;
pub mod fus;
pub mod manifest;
mod message;
pub mod probe;
pub mod relay;
pub mod rewrite;
pub mod transfer;
pub mod unwrap;
pub mod version;
