pub mod app;
pub mod audio;
pub mod config;
pub mod playback;
pub mod session;
pub mod transport;
