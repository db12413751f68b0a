// # Query-Tree Algebra
//
// The WHERE-clause data model the czar rewrites and renders back to SQL:
// - value-expression and column-ref primitives
// - the Predicate / BoolTerm sum types
// - a QueryTemplate renderer producing per-chunk SQL text
// - a factory importing a generic parse tree into the algebra

pub mod bool_term;
pub mod factory;
pub mod predicate;
pub mod template;
pub mod value;

pub use bool_term::{BoolFactorTerm, BoolTerm};
pub use factory::{BoolTermFactory, ParseNode, TokenType};
pub use predicate::{CompOp, Predicate};
pub use template::QueryTemplate;
pub use value::{ColumnRef, ValueExpr, ValueExprPtr};
