//! Data models for Khovaiton

mod fabric;
mod image;
mod upload;

pub use fabric::FabricCode;
pub use image::{ImageRecord, ImageSource, MappingTable, MappingValue};
pub use upload::UploadResult;
