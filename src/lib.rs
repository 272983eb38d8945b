pub mod app;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod fields;
pub mod manifest;
pub mod output;
pub mod portal;
pub mod transfer;
pub mod walker;
pub mod workspace;
