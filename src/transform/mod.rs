//! Payload transforms (raw bytes → typed work items).
pub mod decode;
