// Library exports for Leafpub
// The binary and the integration tests both build on these modules.

pub mod auth;
pub mod backup;
pub mod cache;
pub mod config;
pub mod datetime;
pub mod db;
pub mod error;
pub mod events;
pub mod extractors;
pub mod feed;
pub mod import;
pub mod models;
pub mod plugins;
pub mod query;
pub mod render;
pub mod routes;
pub mod settings;
pub mod slug;
pub mod state;
pub mod update;
