//! VeloMarket Order Backend Library
//!
//! This library exports the core modules for the VeloMarket order
//! settlement backend.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod marketplace;
pub mod middleware;
pub mod models;
pub mod orders;
pub mod policy;
pub mod routes;
pub mod state;
