use crate::engine::types::{AttributePath, TupleSnapshot};
use smol_str::SmolStr;

/// Problems detected while building a plan from a view setting.
/// Locations read `View.attribute.path`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown view type '{name}' referenced at {location}")]
    UnknownViewType { location: String, name: SmolStr },

    #[error("duplicate attribute '{attribute}' on view type '{view}'")]
    DuplicateAttribute { view: SmolStr, attribute: SmolStr },

    #[error("id attribute '{attribute}' of view type '{view}' is missing or not a singular basic value")]
    InvalidIdAttribute { view: SmolStr, attribute: SmolStr },

    #[error("attribute {location} declares an index mapping but a {plurality} can not be indexed")]
    IllegalIndexMapping { location: String, plurality: SmolStr },

    #[error("attribute {location} is keyed by position or key and needs an index mapping")]
    MissingKeyMapping { location: String },

    #[error("list attribute {location} can not be sorted; declare it as a set or map")]
    SortedList { location: String },

    #[error("correlated attribute {location} can not be indexed")]
    IndexedCorrelation { location: String },

    #[error("correlated attribute {location} declares a limiter but provider '{provider}' imposes its own")]
    ConflictingLimiter { location: String, provider: SmolStr },

    #[error("mapping '{mapping}' of attribute {location} can not be resolved: {reason}")]
    UnresolvablePath {
        location: String,
        mapping: String,
        reason: String,
    },

    #[error("no provider named '{name}' is registered for attribute {location}")]
    UnknownProvider { location: String, name: SmolStr },

    #[error("view type '{view}' declares {count} constructors and none was selected")]
    AmbiguousConstructor { view: SmolStr, count: usize },

    #[error("view type '{view}' has no constructor named '{name}'")]
    UnknownConstructor { view: SmolStr, name: SmolStr },

    #[error("no view factory named '{name}' is registered for view type '{view}'")]
    UnknownFactory { view: SmolStr, name: SmolStr },

    #[error("view type '{view}' lists '{subtype}' as a subtype but '{subtype}' does not extend it")]
    InvalidSubtype { view: SmolStr, subtype: SmolStr },

    #[error("attribute {location} is updatable but view type '{view}' is read-only")]
    UpdatableOnReadOnly { location: String, view: SmolStr },

    #[error("attribute {location}: {message}")]
    Invalid { location: String, message: String },
}

/// Failures while turning rows into view instances.
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("row has {found} slots but the plan expects {expected}: {tuple}")]
    TupleWidth {
        expected: usize,
        found: usize,
        tuple: TupleSnapshot,
    },

    #[error("attribute {path} expects {expected} but slot {slot} holds {found}: {tuple}")]
    TypeMismatch {
        path: AttributePath,
        slot: usize,
        expected: SmolStr,
        found: SmolStr,
        tuple: TupleSnapshot,
    },

    #[error("index {index} of attribute {path} is outside [0, {size}): {tuple}")]
    IndexOutOfRange {
        path: AttributePath,
        index: String,
        size: usize,
        tuple: TupleSnapshot,
    },

    #[error("duplicate key {key} with a different value in attribute {path}: {tuple}")]
    DuplicateKey {
        path: AttributePath,
        key: String,
        tuple: TupleSnapshot,
    },

    #[error("duplicate element {element} in strictly unique attribute {path}: {tuple}")]
    DuplicateElement {
        path: AttributePath,
        element: String,
        tuple: TupleSnapshot,
    },

    #[error("rows of {path} for parent {key} arrived non-contiguously")]
    NonContiguousGroup { path: AttributePath, key: String },

    #[error("could not construct '{view}' at {path}: {message}; arguments {tuple}")]
    Construction {
        view: SmolStr,
        path: AttributePath,
        message: String,
        tuple: TupleSnapshot,
    },

    #[error("attribute {path} is select-fetched but no correlation executor was supplied")]
    MissingExecutor { path: AttributePath },

    #[error(transparent)]
    Tracking(#[from] TrackingError),

    #[error("row source failed: {0}")]
    Source(#[source] anyhow::Error),
}

/// Misuse of the change-tracking API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackingError {
    #[error("view type '{view}' has no attribute '{attribute}'")]
    UnknownAttribute { view: SmolStr, attribute: SmolStr },

    #[error("attribute '{attribute}' of view type '{view}' is not updatable")]
    NotUpdatable { view: SmolStr, attribute: SmolStr },

    #[error("a '{view}' instance is already owned by another parent")]
    AlreadyHasParent { view: SmolStr },
}
