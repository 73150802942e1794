pub mod chat;
pub mod db;
pub mod error;
pub mod meal_plans;
pub mod models;
pub mod nutrition;
pub mod sse;
pub mod storage;
pub mod tracking;

pub use chat::{ChatMessage, ChatRole, ChatSession, ChatSnapshot, ChatTransport};
pub use db::Database;
pub use error::ApiError;
pub use meal_plans::{CacheConfig, DataSource, MealPlanService, ReconcilePolicy};
pub use storage::KeyValueStore;
