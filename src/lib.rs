pub mod config;
pub mod engine;
pub mod error;
pub mod filters;
pub mod local;
pub mod processing;
pub mod session;
pub mod stream;
pub mod utils;

pub use config::{Config, FilterConfig, NotchConfig, ProbeGeometry};
pub use engine::Engine;
pub use error::{NeuroLayerError, Result};
pub use session::{AcquisitionControl, EventNotification, Presentation};
