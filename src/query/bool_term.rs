// Boolean-term nodes of the WHERE-clause DAG.

use std::fmt;

use crate::query::predicate::Predicate;
use crate::query::template::QueryTemplate;
use crate::query::value::{ColumnRef, ValueExprPtr};

/// One factor inside a BoolFactor node.
#[derive(Debug, Clone, PartialEq)]
pub enum BoolFactorTerm {
    Predicate(Predicate),
    /// A nested boolean term used where a factor is expected, e.g. a
    /// parenthesized OR inside an AND chain.
    BoolTermFactor(Box<BoolTerm>),
    /// Verbatim token text reproduced by the rendering pass.
    Pass(String),
}

impl BoolFactorTerm {
    pub fn render_to(&self, qt: &mut QueryTemplate) {
        match self {
            BoolFactorTerm::Predicate(p) => p.render_to(qt),
            BoolFactorTerm::BoolTermFactor(t) => t.render_to(qt),
            BoolFactorTerm::Pass(text) => qt.append(text.clone()),
        }
    }

    pub fn clone_deep(&self) -> BoolFactorTerm {
        match self {
            BoolFactorTerm::Predicate(p) => BoolFactorTerm::Predicate(p.clone_deep()),
            BoolFactorTerm::BoolTermFactor(t) => {
                BoolFactorTerm::BoolTermFactor(Box::new(t.clone_deep()))
            }
            BoolFactorTerm::Pass(text) => BoolFactorTerm::Pass(text.clone()),
        }
    }

    pub fn copy_syntax(&self) -> BoolFactorTerm {
        match self {
            BoolFactorTerm::Predicate(p) => BoolFactorTerm::Predicate(p.copy_syntax()),
            BoolFactorTerm::BoolTermFactor(t) => {
                BoolFactorTerm::BoolTermFactor(Box::new(t.copy_syntax()))
            }
            BoolFactorTerm::Pass(text) => BoolFactorTerm::Pass(text.clone()),
        }
    }

    pub fn find_column_refs(&self, out: &mut Vec<ColumnRef>) {
        match self {
            BoolFactorTerm::Predicate(p) => p.find_column_refs(out),
            BoolFactorTerm::BoolTermFactor(t) => t.find_column_refs(out),
            BoolFactorTerm::Pass(_) => {}
        }
    }

    pub fn find_value_exprs(&self, out: &mut Vec<ValueExprPtr>) {
        match self {
            BoolFactorTerm::Predicate(p) => p.find_value_exprs(out),
            BoolFactorTerm::BoolTermFactor(t) => t.find_value_exprs(out),
            BoolFactorTerm::Pass(_) => {}
        }
    }
}

/// A node of the WHERE-clause DAG.
#[derive(Debug, Clone, PartialEq)]
pub enum BoolTerm {
    Or(Vec<BoolTerm>),
    And(Vec<BoolTerm>),
    Factor(Vec<BoolFactorTerm>),
    /// Verbatim token text, e.g. parentheses the rewriter does not model.
    Pass(String),
    /// A term the importer could not classify.
    Unknown,
    /// A bare value expression standing in boolean position.
    ValueExpr(ValueExprPtr),
}

impl BoolTerm {
    pub fn name(&self) -> &'static str {
        match self {
            BoolTerm::Or(_) => "OrTerm",
            BoolTerm::And(_) => "AndTerm",
            BoolTerm::Factor(_) => "BoolFactor",
            BoolTerm::Pass(_) => "PassTerm",
            BoolTerm::Unknown => "UnknownTerm",
            BoolTerm::ValueExpr(_) => "ValueExprTerm",
        }
    }

    pub fn render_to(&self, qt: &mut QueryTemplate) {
        match self {
            BoolTerm::Or(terms) => Self::render_joined(terms, "OR", qt),
            BoolTerm::And(terms) => Self::render_joined(terms, "AND", qt),
            BoolTerm::Factor(factors) => {
                for factor in factors {
                    factor.render_to(qt);
                }
            }
            BoolTerm::Pass(text) => qt.append(text.clone()),
            BoolTerm::Unknown => {}
            BoolTerm::ValueExpr(expr) => expr.render_to(qt),
        }
    }

    fn render_joined(terms: &[BoolTerm], sep: &str, qt: &mut QueryTemplate) {
        for (i, term) in terms.iter().enumerate() {
            if i > 0 {
                qt.append(sep);
            }
            term.render_to(qt);
        }
    }

    pub fn sql(&self) -> String {
        let mut qt = QueryTemplate::new();
        self.render_to(&mut qt);
        qt.sql()
    }

    /// Deep copy: the cloned DAG shares no nodes with `self`.
    pub fn clone_deep(&self) -> BoolTerm {
        match self {
            BoolTerm::Or(terms) => BoolTerm::Or(terms.iter().map(|t| t.clone_deep()).collect()),
            BoolTerm::And(terms) => BoolTerm::And(terms.iter().map(|t| t.clone_deep()).collect()),
            BoolTerm::Factor(factors) => {
                BoolTerm::Factor(factors.iter().map(|f| f.clone_deep()).collect())
            }
            BoolTerm::Pass(text) => BoolTerm::Pass(text.clone()),
            BoolTerm::Unknown => BoolTerm::Unknown,
            BoolTerm::ValueExpr(expr) => BoolTerm::ValueExpr(expr.clone_deep()),
        }
    }

    /// Shallow copy: fresh interior nodes, shared operand leaves.
    pub fn copy_syntax(&self) -> BoolTerm {
        match self {
            BoolTerm::Or(terms) => BoolTerm::Or(terms.iter().map(|t| t.copy_syntax()).collect()),
            BoolTerm::And(terms) => BoolTerm::And(terms.iter().map(|t| t.copy_syntax()).collect()),
            BoolTerm::Factor(factors) => {
                BoolTerm::Factor(factors.iter().map(|f| f.copy_syntax()).collect())
            }
            BoolTerm::Pass(text) => BoolTerm::Pass(text.clone()),
            BoolTerm::Unknown => BoolTerm::Unknown,
            BoolTerm::ValueExpr(expr) => BoolTerm::ValueExpr(expr.clone()),
        }
    }

    pub fn find_column_refs(&self, out: &mut Vec<ColumnRef>) {
        match self {
            BoolTerm::Or(terms) | BoolTerm::And(terms) => {
                for term in terms {
                    term.find_column_refs(out);
                }
            }
            BoolTerm::Factor(factors) => {
                for factor in factors {
                    factor.find_column_refs(out);
                }
            }
            BoolTerm::ValueExpr(expr) => expr.find_column_refs(out),
            BoolTerm::Pass(_) | BoolTerm::Unknown => {}
        }
    }

    pub fn find_value_exprs(&self, out: &mut Vec<ValueExprPtr>) {
        match self {
            BoolTerm::Or(terms) | BoolTerm::And(terms) => {
                for term in terms {
                    term.find_value_exprs(out);
                }
            }
            BoolTerm::Factor(factors) => {
                for factor in factors {
                    factor.find_value_exprs(out);
                }
            }
            BoolTerm::ValueExpr(expr) => out.push(expr.clone()),
            BoolTerm::Pass(_) | BoolTerm::Unknown => {}
        }
    }
}

impl fmt::Display for BoolTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.sql())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::predicate::{CompOp, Predicate};
    use crate::query::value::ValueExpr;

    fn sample_and() -> BoolTerm {
        BoolTerm::And(vec![
            BoolTerm::Factor(vec![BoolFactorTerm::Predicate(Predicate::Between {
                value: ValueExpr::column("a"),
                min_value: ValueExpr::literal("1"),
                max_value: ValueExpr::literal("2"),
                has_not: false,
            })]),
            BoolTerm::Factor(vec![BoolFactorTerm::Predicate(Predicate::In {
                value: ValueExpr::column("b"),
                cands: vec![ValueExpr::literal("3"), ValueExpr::literal("4")],
                has_not: false,
            })]),
        ])
    }

    #[test]
    fn test_render_and_of_factors() {
        assert_eq!(sample_and().sql(), "a BETWEEN 1 AND 2 AND b IN ( 3 , 4 )");
    }

    #[test]
    fn test_clone_deep_equal_and_independent() {
        let original = sample_and();
        let mut clone = original.clone_deep();
        assert_eq!(original, clone);

        // Mutating the clone must not be observable through the original.
        if let BoolTerm::And(terms) = &mut clone {
            terms.push(BoolTerm::Pass("1".to_string()));
        }
        assert_ne!(original, clone);
        assert_eq!(original, sample_and());
    }

    #[test]
    fn test_or_render_and_find_refs() {
        let term = BoolTerm::Or(vec![
            BoolTerm::Factor(vec![BoolFactorTerm::Predicate(Predicate::Comp {
                left: ValueExpr::column("ra"),
                op: CompOp::LessThan,
                right: ValueExpr::literal("5"),
            })]),
            BoolTerm::Factor(vec![BoolFactorTerm::Pass("TRUE".to_string())]),
        ]);
        assert_eq!(term.sql(), "ra < 5 OR TRUE");

        let mut refs = Vec::new();
        term.find_column_refs(&mut refs);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].column, "ra");
    }

    #[test]
    fn test_nested_bool_term_factor() {
        let nested = BoolTerm::Factor(vec![
            BoolFactorTerm::Pass("(".to_string()),
            BoolFactorTerm::BoolTermFactor(Box::new(sample_and())),
            BoolFactorTerm::Pass(")".to_string()),
        ]);
        assert_eq!(nested.sql(), "( a BETWEEN 1 AND 2 AND b IN ( 3 , 4 ) )");

        let mut exprs = Vec::new();
        nested.find_value_exprs(&mut exprs);
        assert_eq!(exprs.len(), 6);
    }
}
