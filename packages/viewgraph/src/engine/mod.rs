pub mod accumulator;
pub mod builder;
pub mod construct;
pub mod correlation;
pub mod mapping;
pub mod metamodel;
pub mod providers;
pub mod template;
pub mod tracking;
pub mod transform;
pub mod types;
pub mod update;

pub use builder::GraphBuilder;
pub use construct::{ConstructionStrategy, StrategyKey, StrategyRegistry};
pub use correlation::{CorrelatedQuery, CorrelationBuilder, CorrelationExecutor, CorrelationProvider};
pub use metamodel::{AttributeMapping, Metamodel, ViewType};
pub use providers::{ProviderRegistry, ViewFactory};
pub use template::{MaterializationPlan, ViewSetting};
pub use tracking::ViewRef;
pub use types::{AttributePath, FastMap, FastSet, ResultTuple, Value};
