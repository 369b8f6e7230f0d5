pub mod fs;
pub mod serde_base64;
