// HTTP API layer for CaseStrainer

pub mod rest_api;

pub use rest_api::{create_api_server, ApiState};
