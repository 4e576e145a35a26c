pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod models;
pub mod permissions;
pub mod repository;
pub mod resolver;
pub mod routes;
pub mod sanitize;
pub mod state;
pub mod storage;
pub mod token;
