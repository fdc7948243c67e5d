pub mod config;
pub mod error;
pub mod image;
pub mod naming;
pub mod quantity;

pub use config::KubeManagerConfig;
pub use error::{CoreError, CoreResult};
pub use image::ImageRef;
pub use quantity::Quantity;
