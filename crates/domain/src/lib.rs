pub mod entities;
pub mod messaging;
pub mod repositories;
pub mod sandbox;
pub mod services;
pub mod value_objects;

pub use entities::*;
pub use messaging::*;
pub use repositories::*;
pub use sandsched_errors::{SchedulerError, SchedulerResult};
pub use sandbox::*;
pub use services::*;
pub use value_objects::*;
