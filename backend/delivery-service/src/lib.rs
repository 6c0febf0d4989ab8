/// Push delivery service
///
/// Wires one configured provider into a `DeliveryQueue`: producers enqueue messages,
/// a single worker drives them through the provider's connection, and terminal failures
/// come back through the error callback.
pub mod config;
pub mod metrics;
pub mod services;

pub use config::{Config, ProviderConfig, ProviderKind};
pub use services::{DeliveryQueue, Observers};
