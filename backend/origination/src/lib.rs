//! Financing origination service.
//!
//! Tracks a customer's progress through the application steps of a
//! contract (`terms → kyc → bank → payment → signing`), persists it in
//! SQLite and exposes it over a small Axum REST API.

pub mod api;
pub mod client;
pub mod components;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod signature;
pub mod steps;
pub mod vendors;
