pub mod blob;
pub mod config;
pub mod error;
pub mod guard;
pub mod image_handler;
pub mod models;
pub mod operators;
pub mod password;
pub mod pipeline;
pub mod records;
pub mod service;
pub mod spec;
pub mod utils;

pub use error::{ImageVaultError, Result};
pub use service::{MediaService, ServiceOptions};
pub use spec::TransformationSpec;
