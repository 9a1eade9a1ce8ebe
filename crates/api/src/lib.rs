//! Job API: create, inspect, update, and stream pipeline jobs over HTTP.

pub mod app;
pub mod config;
