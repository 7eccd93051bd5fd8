pub mod app;
pub mod config;
pub mod keybinds;
pub mod setup;
pub mod ui;

pub use config::Config;
