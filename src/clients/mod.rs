pub mod fan;
pub mod graph;
pub mod health;
pub mod redis;
pub mod traits;
