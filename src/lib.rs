pub mod backend;
pub mod config;
pub mod error;
pub mod handler;
pub mod location;
pub mod planner;
pub mod pool;
pub mod range;
pub mod s3;
pub mod server;
pub mod streamer;
