pub mod delivery_queue;
pub mod observers;
mod worker;

pub use delivery_queue::DeliveryQueue;
pub use observers::{ErrorCallback, Observers, SendCallback};
