//! LiveCap server: Axum HTTP + WebSocket over the core manager.

mod web_server;

pub use web_server::{build_app, run_web_server};
