pub mod adapter;
pub mod cli;
pub mod config;
pub mod error;
pub mod fixture;
pub mod service;
