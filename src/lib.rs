pub mod agent;
pub mod approval;
pub mod audit;
pub mod bridge;
pub mod chat;
pub mod error;
pub mod events;
pub mod llm;
pub mod logging;
pub mod mutation;
pub mod paths;
pub mod project;
pub mod registry;
pub mod scene;
pub mod security;
pub mod settings;
pub mod state;
pub mod transport;
