// Domain layer modules
pub mod domain;

// Application layer modules
pub mod application;

// Infrastructure layer modules
pub mod infrastructure;

// HTTP and WebSocket gateway
pub mod gateway;
