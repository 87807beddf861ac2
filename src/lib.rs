pub mod baseline;
pub mod classifier;
pub mod cost;
pub mod db;
pub mod error;
pub mod exclusion;
pub mod recompute;
pub mod scheduler;
pub mod tiering;
