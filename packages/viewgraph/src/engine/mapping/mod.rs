//! Mapping expressions and the slot mappers that project them.

mod expression;
mod mapper;

pub use expression::{check_expression, is_plain_path, prefix_expression};
pub use mapper::{
    attribute_alias, element_expression, index_expression, key_alias, substitute_alias, textual,
    JoinFragment, ParameterRegistry, Projection, QueryFragments, SlotMapper, SubqueryBuilder,
    SubqueryProvider,
};
