mod error;
pub mod image;

pub use error::ApiError;
