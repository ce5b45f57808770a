mod expiry;

pub use expiry::{DomainState, ExpiryScheduler};
