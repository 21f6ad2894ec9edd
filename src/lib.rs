pub mod api;
pub mod clients;
pub mod config;
pub mod models;
pub mod senders;
pub mod services;
pub mod supervisor;
pub mod utils;
