pub mod config;
pub mod logging;

// Core modules
pub mod batch;
pub mod control;
pub mod pool;
pub mod retry;
