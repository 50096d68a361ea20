pub mod chaininfo;
pub mod config;
pub mod service;
