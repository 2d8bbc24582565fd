pub mod audio_models;
pub mod config;
pub mod error;
pub mod format;
pub mod permission;
pub mod state;
