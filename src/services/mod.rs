//! The object store built on top of a [`Transport`](crate::transport::Transport).

pub mod catalog;
pub mod chunker;
pub mod decoder;
pub mod encoder;
pub mod layout;
pub mod locks;
pub mod preview;
pub mod progress;
pub mod store_service;

pub use encoder::{PreviewImage, StoredObject, Upload};
pub use store_service::{StoreError, StoreResult, StoreService, StoreSettings};
