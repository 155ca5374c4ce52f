pub mod config;
pub mod dispatch;
pub mod executor;
pub mod limiter;
pub mod sandbox;
pub mod shared;
pub mod state;
