pub mod auth;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;
pub mod store;

use std::sync::Arc;

use config::Config;
use gateway::supervisor::Supervisor;
use gateway::Gateway;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gateway: Gateway,
    pub supervisor: Arc<Supervisor>,
}
