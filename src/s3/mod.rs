//! Remote snapshot storage on S3-compatible object stores

pub mod client;
pub mod sigv4;

pub use client::S3Client;
