// src/lib.rs

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod service;

// Re-export commonly used types for convenience
pub use config::MaterializerConfig;
pub use engine::correlation::{CorrelatedQuery, CorrelationExecutor};
pub use engine::metamodel::{AttributeMapping, FetchStrategy, Metamodel, Plurality, ViewType};
pub use engine::providers::ProviderRegistry;
pub use engine::template::{MaterializationPlan, ViewSetting};
pub use engine::tracking::ViewRef;
pub use engine::types::{AttributePath, ResultTuple, Value};
pub use engine::update::{DirtySnapshot, FlushRecord};
pub use error::{ConfigError, MaterializeError, TrackingError};
pub use service::ViewMaterializer;
