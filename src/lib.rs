pub mod config;
pub mod entity_stats;
pub mod error;
pub mod export;
pub mod matchup;
pub mod percentiles;
pub mod pick_rates;
pub mod pipeline;
pub mod store;
pub mod synthetic;
