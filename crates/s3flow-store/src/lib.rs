//! S3-compatible object-storage access for the s3flow ingestion pipeline.
//!
//! This crate owns everything that talks to the origin store: listing
//! objects (polling), subscribing to create/remove notifications, downloading
//! blobs to disk, and generating presigned URLs. It knows nothing about
//! products, image groups, or expressions — it only produces [`Event`]s on a
//! channel and performs the handful of blocking operations the cache layer
//! asks for.

mod client;
mod error;
mod event;
mod source;

pub use client::{ObjectMeta, ObjectStore, StoreClient, SIGNED_URL_LIFETIME};
pub use error::StoreError;
pub use event::{Event, EventType, ObjectType};
pub use source::{NotificationSource, ObjectSource, PollingSource, RawNotification};

#[cfg(any(test, feature = "test-util"))]
pub use client::MockObjectStore;
