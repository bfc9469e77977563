pub mod config;
pub mod database;
pub mod errors;
pub mod models;
pub mod repositories;
pub mod streaming;
pub mod web;
