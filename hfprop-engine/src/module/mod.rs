pub mod grid;
pub mod solar;
pub mod band;
pub mod state;
pub mod signal;
pub mod router;
pub mod feed;
pub mod engine;
pub mod scheduled;
pub mod handler;
