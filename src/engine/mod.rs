pub mod executor;
pub mod handlers;
pub mod types;

pub use executor::RunEngine;
pub use handlers::{HandlerRegistry, IntentPolicy, StepDeps, StepHandler};
