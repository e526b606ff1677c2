// chatbook-sync: real-time sync core for the chatbook client.

pub mod auth;
pub mod cache;
pub mod config;
pub mod connection;
pub mod delta;
pub mod optimistic;
pub mod runtime;
pub mod session;
