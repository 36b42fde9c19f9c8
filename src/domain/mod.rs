pub mod clock;
pub mod collaborators;
pub mod model;
pub mod scheduler;
pub mod telemetry;
pub mod utils;
