pub mod config;
pub mod logging;
pub mod task;
pub mod web;
pub mod worker;
