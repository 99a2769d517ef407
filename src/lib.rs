pub mod api;
pub mod audit;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod rollout;
pub mod service;
