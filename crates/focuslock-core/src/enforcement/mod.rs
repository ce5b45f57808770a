mod controller;

pub use controller::{Directive, EnforcementController, EnforcementState};
