//! feedrelay: polls and receives feeds, filters new entries and fans them
//! out to pluggable outputs.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod expr;
pub mod feed;
pub mod filter;
pub mod format;
pub mod model;
pub mod output;
pub mod plugin;
pub mod server;
pub mod service;
pub mod storage;
pub mod util;
