pub mod config;
pub mod database;
pub mod insight_repository;
pub mod state_repository;
pub mod token_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use insight_repository::InsightRepository;
pub use state_repository::StateRepository;
pub use token_repository::TokenRepository;
