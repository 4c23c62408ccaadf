pub mod api;
pub mod app;
pub mod artifacts;
pub mod cli;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod flows;
pub mod governor;
pub mod plugins;
pub mod providers;
pub mod storage;
