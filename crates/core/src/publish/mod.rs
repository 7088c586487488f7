//! Publishing of pipeline results.
//!
//! The [`ResultPublisher`] uploads artifacts to the object store, then
//! performs the holder's final conditional write (`Uploading -> Complete`)
//! carrying the artifact locations and image metadata.

mod error;
mod publisher;

pub use error::PublishError;
pub use publisher::ResultPublisher;
