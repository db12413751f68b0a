// Predicate variants of the WHERE-clause algebra.

use std::fmt;

use crate::error::{Result, ShardError};
use crate::query::template::QueryTemplate;
use crate::query::value::{ColumnRef, ValueExpr, ValueExprPtr, ValueExprRenderer};

/// Comparison operator of a CompPredicate.
///
/// `NotEqualsAlt` keeps the `!=` spelling distinct from `<>` so that a
/// rendered query reproduces its source text; the two compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Equals,
    NotEquals,
    LessThan,
    GreaterThan,
    LessThanOrEquals,
    GreaterThanOrEquals,
    NotEqualsAlt,
}

impl CompOp {
    /// Map an ASCII operator string to its token. Anything outside
    /// `{=, <, >, <=, >=, <>, !=}` is rejected.
    pub fn lookup(op: &str) -> Result<CompOp> {
        match op {
            "=" => Ok(CompOp::Equals),
            "<" => Ok(CompOp::LessThan),
            ">" => Ok(CompOp::GreaterThan),
            "<=" => Ok(CompOp::LessThanOrEquals),
            ">=" => Ok(CompOp::GreaterThanOrEquals),
            "<>" => Ok(CompOp::NotEquals),
            "!=" => Ok(CompOp::NotEqualsAlt),
            _ => Err(ShardError::QueryParse(format!("invalid comparison operator: {:?}", op))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompOp::Equals => "=",
            CompOp::NotEquals => "<>",
            CompOp::LessThan => "<",
            CompOp::GreaterThan => ">",
            CompOp::LessThanOrEquals => "<=",
            CompOp::GreaterThanOrEquals => ">=",
            CompOp::NotEqualsAlt => "!=",
        }
    }

    /// Collapse spelling variants: `!=` and `<>` denote the same operator.
    pub fn normalized(&self) -> CompOp {
        match self {
            CompOp::NotEqualsAlt => CompOp::NotEquals,
            other => *other,
        }
    }
}

/// A leaf of the WHERE DAG: one SQL predicate.
#[derive(Debug, Clone)]
pub enum Predicate {
    Comp {
        left: ValueExprPtr,
        op: CompOp,
        right: ValueExprPtr,
    },
    Between {
        value: ValueExprPtr,
        min_value: ValueExprPtr,
        max_value: ValueExprPtr,
        has_not: bool,
    },
    In {
        value: ValueExprPtr,
        cands: Vec<ValueExprPtr>,
        has_not: bool,
    },
    Like {
        value: ValueExprPtr,
        char_value: ValueExprPtr,
        has_not: bool,
    },
    Null {
        value: ValueExprPtr,
        has_not: bool,
    },
    /// A predicate whose internal structure does not matter to the rewriter;
    /// its source tokens are carried verbatim.
    Generic {
        tokens: Vec<String>,
    },
}

impl Predicate {
    pub fn name(&self) -> &'static str {
        match self {
            Predicate::Comp { .. } => "CompPredicate",
            Predicate::Between { .. } => "BetweenPredicate",
            Predicate::In { .. } => "InPredicate",
            Predicate::Like { .. } => "LikePredicate",
            Predicate::Null { .. } => "NullPredicate",
            Predicate::Generic { .. } => "GenericPredicate",
        }
    }

    pub fn render_to(&self, qt: &mut QueryTemplate) {
        match self {
            Predicate::Comp { left, op, right } => {
                let mut r = ValueExprRenderer::new(qt, false);
                r.render(left);
                qt.append(op.as_str());
                let mut r = ValueExprRenderer::new(qt, false);
                r.render(right);
            }
            Predicate::Between { value, min_value, max_value, has_not } => {
                let mut r = ValueExprRenderer::new(qt, false);
                r.render(value);
                if *has_not {
                    qt.append("NOT");
                }
                qt.append("BETWEEN");
                let mut r = ValueExprRenderer::new(qt, false);
                r.render(min_value);
                qt.append("AND");
                let mut r = ValueExprRenderer::new(qt, false);
                r.render(max_value);
            }
            Predicate::In { value, cands, has_not } => {
                let mut r = ValueExprRenderer::new(qt, false);
                r.render(value);
                if *has_not {
                    qt.append("NOT");
                }
                qt.append("IN");
                qt.append("(");
                let mut r = ValueExprRenderer::new(qt, true);
                for cand in cands {
                    r.render(cand);
                }
                qt.append(")");
            }
            Predicate::Like { value, char_value, has_not } => {
                let mut r = ValueExprRenderer::new(qt, false);
                r.render(value);
                if *has_not {
                    qt.append("NOT");
                }
                qt.append("LIKE");
                let mut r = ValueExprRenderer::new(qt, false);
                r.render(char_value);
            }
            Predicate::Null { value, has_not } => {
                let mut r = ValueExprRenderer::new(qt, false);
                r.render(value);
                qt.append("IS");
                if *has_not {
                    qt.append("NOT");
                }
                qt.append("NULL");
            }
            Predicate::Generic { tokens } => {
                for token in tokens {
                    qt.append(token.clone());
                }
            }
        }
    }

    /// Deep copy: cloned operand DAGs are fully disjoint from `self`.
    pub fn clone_deep(&self) -> Predicate {
        match self {
            Predicate::Comp { left, op, right } => Predicate::Comp {
                left: left.clone_deep(),
                op: *op,
                right: right.clone_deep(),
            },
            Predicate::Between { value, min_value, max_value, has_not } => Predicate::Between {
                value: value.clone_deep(),
                min_value: min_value.clone_deep(),
                max_value: max_value.clone_deep(),
                has_not: *has_not,
            },
            Predicate::In { value, cands, has_not } => Predicate::In {
                value: value.clone_deep(),
                cands: cands.iter().map(|c| c.clone_deep()).collect(),
                has_not: *has_not,
            },
            Predicate::Like { value, char_value, has_not } => Predicate::Like {
                value: value.clone_deep(),
                char_value: char_value.clone_deep(),
                has_not: *has_not,
            },
            Predicate::Null { value, has_not } => Predicate::Null {
                value: value.clone_deep(),
                has_not: *has_not,
            },
            Predicate::Generic { tokens } => Predicate::Generic { tokens: tokens.clone() },
        }
    }

    /// Shallow copy preserving the reference identity of operands, for
    /// rewrites that substitute operands in place.
    pub fn copy_syntax(&self) -> Predicate {
        self.clone()
    }

    pub fn find_column_refs(&self, out: &mut Vec<ColumnRef>) {
        self.for_each_value_expr(|v| v.find_column_refs(out));
    }

    pub fn find_value_exprs(&self, out: &mut Vec<ValueExprPtr>) {
        match self {
            Predicate::Comp { left, right, .. } => {
                out.push(left.clone());
                out.push(right.clone());
            }
            Predicate::Between { value, min_value, max_value, .. } => {
                out.push(value.clone());
                out.push(min_value.clone());
                out.push(max_value.clone());
            }
            Predicate::In { value, cands, .. } => {
                out.push(value.clone());
                out.extend(cands.iter().cloned());
            }
            Predicate::Like { value, char_value, .. } => {
                out.push(value.clone());
                out.push(char_value.clone());
            }
            Predicate::Null { value, .. } => out.push(value.clone()),
            Predicate::Generic { .. } => {}
        }
    }

    fn for_each_value_expr(&self, mut f: impl FnMut(&ValueExpr)) {
        let mut exprs = Vec::new();
        self.find_value_exprs(&mut exprs);
        for expr in exprs {
            f(&expr);
        }
    }
}

impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Predicate::Comp { left: l1, op: o1, right: r1 },
                Predicate::Comp { left: l2, op: o2, right: r2 },
            ) => l1 == l2 && o1.normalized() == o2.normalized() && r1 == r2,
            (
                Predicate::Between { value: v1, min_value: lo1, max_value: hi1, has_not: n1 },
                Predicate::Between { value: v2, min_value: lo2, max_value: hi2, has_not: n2 },
            ) => v1 == v2 && lo1 == lo2 && hi1 == hi2 && n1 == n2,
            (
                Predicate::In { value: v1, cands: c1, has_not: n1 },
                Predicate::In { value: v2, cands: c2, has_not: n2 },
            ) => v1 == v2 && c1 == c2 && n1 == n2,
            (
                Predicate::Like { value: v1, char_value: c1, has_not: n1 },
                Predicate::Like { value: v2, char_value: c2, has_not: n2 },
            ) => v1 == v2 && c1 == c2 && n1 == n2,
            (
                Predicate::Null { value: v1, has_not: n1 },
                Predicate::Null { value: v2, has_not: n2 },
            ) => v1 == v2 && n1 == n2,
            (Predicate::Generic { tokens: t1 }, Predicate::Generic { tokens: t2 }) => t1 == t2,
            _ => false,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut qt = QueryTemplate::new();
        self.render_to(&mut qt);
        write!(f, "{}({})", self.name(), qt)
    }
}
