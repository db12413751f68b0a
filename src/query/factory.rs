// Import of a generic parse tree into the BoolTerm algebra.
//
// The SQL grammar itself lives outside this crate; whatever front end is in
// use hands the importer a tree of typed tokens. The factory walks the
// children of each node and dispatches on token type, so the algebra never
// depends on a particular parser.

use tracing::debug;

use crate::error::{Result, ShardError};
use crate::query::bool_term::{BoolFactorTerm, BoolTerm};
use crate::query::predicate::{CompOp, Predicate};
use crate::query::value::{ValueExpr, ValueExprPtr};

/// Token classification of a parse node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    OrOp,
    AndOp,
    BooleanFactor,
    ValueExp,
    CompPredicate,
    BetweenPredicate,
    InPredicate,
    LikePredicate,
    NullPredicate,
    QuantifiedCompPredicate,
    MatchPredicate,
    OverlapsPredicate,
    CompOp,
    Ident,
    Literal,
    Comma,
    LeftParen,
    RightParen,
    Word,
}

/// One node of the parser-neutral input tree.
#[derive(Debug, Clone)]
pub struct ParseNode {
    pub token: TokenType,
    pub text: String,
    pub children: Vec<ParseNode>,
}

impl ParseNode {
    pub fn new(token: TokenType, text: impl Into<String>) -> Self {
        Self { token, text: text.into(), children: Vec::new() }
    }

    pub fn with_children(token: TokenType, text: impl Into<String>, children: Vec<ParseNode>) -> Self {
        Self { token, text: text.into(), children }
    }

    /// A VALUE_EXP node wrapping a single operand token.
    pub fn value_exp(child: ParseNode) -> Self {
        Self::with_children(TokenType::ValueExp, "", vec![child])
    }

    pub fn ident(name: impl Into<String>) -> Self {
        Self::new(TokenType::Ident, name)
    }

    pub fn literal(text: impl Into<String>) -> Self {
        Self::new(TokenType::Literal, text)
    }

    pub fn word(text: impl Into<String>) -> Self {
        Self::new(TokenType::Word, text)
    }
}

/// Builds BoolTerm DAGs from parse trees.
#[derive(Debug, Default)]
pub struct BoolTermFactory;

impl BoolTermFactory {
    pub fn new() -> Self {
        Self
    }

    /// Construct a BoolTerm from a node, delegating on its type.
    pub fn new_bool_term(&self, node: &ParseNode) -> Result<BoolTerm> {
        match node.token {
            TokenType::OrOp => self.new_or_term(node),
            TokenType::AndOp => self.new_and_term(node),
            TokenType::BooleanFactor => self.new_bool_factor(node),
            TokenType::ValueExp => Err(ShardError::QueryParse(
                "unexpected VALUE_EXP, expected boolean term".to_string(),
            )),
            _ => {
                debug!(token = ?node.token, text = %node.text, "unknown boolean term token");
                Ok(BoolTerm::Unknown)
            }
        }
    }

    fn new_or_term(&self, node: &ParseNode) -> Result<BoolTerm> {
        let mut terms = Vec::new();
        for child in Self::operands(node, "OR") {
            terms.push(self.new_bool_term(child)?);
        }
        Ok(BoolTerm::Or(terms))
    }

    fn new_and_term(&self, node: &ParseNode) -> Result<BoolTerm> {
        let mut terms = Vec::new();
        for child in Self::operands(node, "AND") {
            terms.push(self.new_bool_term(child)?);
        }
        Ok(BoolTerm::And(terms))
    }

    /// Children that are not the keyword separator itself.
    fn operands<'a>(node: &'a ParseNode, keyword: &str) -> impl Iterator<Item = &'a ParseNode> {
        let keyword = keyword.to_string();
        node.children
            .iter()
            .filter(move |c| !(c.token == TokenType::Word && c.text.eq_ignore_ascii_case(&keyword)))
    }

    /// Construct a BoolFactor by importing each child of the factor node.
    pub fn new_bool_factor(&self, node: &ParseNode) -> Result<BoolTerm> {
        let mut factors = Vec::new();
        for child in &node.children {
            factors.push(self.import_factor_term(child)?);
        }
        Ok(BoolTerm::Factor(factors))
    }

    fn import_factor_term(&self, node: &ParseNode) -> Result<BoolFactorTerm> {
        match node.token {
            TokenType::ValueExp => Err(ShardError::QueryParse(
                "unexpected VALUE_EXP in boolean factor".to_string(),
            )),
            TokenType::CompPredicate => {
                Ok(BoolFactorTerm::Predicate(self.new_comp_predicate(node)?))
            }
            TokenType::BetweenPredicate => {
                Ok(BoolFactorTerm::Predicate(self.new_between_predicate(node)?))
            }
            TokenType::InPredicate => Ok(BoolFactorTerm::Predicate(self.new_in_predicate(node)?)),
            TokenType::LikePredicate => {
                Ok(BoolFactorTerm::Predicate(self.new_like_predicate(node)?))
            }
            TokenType::NullPredicate => {
                Ok(BoolFactorTerm::Predicate(self.new_null_predicate(node)?))
            }
            TokenType::QuantifiedCompPredicate => Err(ShardError::QueryParse(
                "QUANTIFIED_COMP_PREDICATE unsupported".to_string(),
            )),
            TokenType::MatchPredicate => {
                Err(ShardError::QueryParse("MATCH_PREDICATE unsupported".to_string()))
            }
            TokenType::OverlapsPredicate => {
                Err(ShardError::QueryParse("OVERLAPS_PREDICATE unsupported".to_string()))
            }
            TokenType::AndOp | TokenType::OrOp => Ok(BoolFactorTerm::BoolTermFactor(Box::new(
                self.new_bool_term(node)?,
            ))),
            _ => Ok(BoolFactorTerm::Pass(node.text.clone())),
        }
    }

    /// `[value, op, value]`
    fn new_comp_predicate(&self, node: &ParseNode) -> Result<Predicate> {
        let [left, op, right] = Self::expect_children(node, "comparison predicate")?;
        Ok(Predicate::Comp {
            left: self.new_value_expr(left)?,
            op: CompOp::lookup(&op.text)?,
            right: self.new_value_expr(right)?,
        })
    }

    /// `[value, BETWEEN, min, AND, max]`
    fn new_between_predicate(&self, node: &ParseNode) -> Result<Predicate> {
        let [value, _between, min_value, _and, max_value] =
            Self::expect_children(node, "between predicate")?;
        Ok(Predicate::Between {
            value: self.new_value_expr(value)?,
            min_value: self.new_value_expr(min_value)?,
            max_value: self.new_value_expr(max_value)?,
            has_not: false,
        })
    }

    /// `[value, IN, (, cand, ",", cand, ... , )]`
    fn new_in_predicate(&self, node: &ParseNode) -> Result<Predicate> {
        let mut children = node.children.iter();
        let value = children
            .next()
            .ok_or_else(|| ShardError::QueryParse("empty IN predicate".to_string()))?;
        let mut cands = Vec::new();
        for child in children {
            match child.token {
                TokenType::ValueExp => cands.push(self.new_value_expr(child)?),
                TokenType::Comma
                | TokenType::LeftParen
                | TokenType::RightParen
                | TokenType::Word => {}
                _ => {
                    return Err(ShardError::QueryParse(format!(
                        "unexpected token in IN list: {:?}",
                        child.token
                    )))
                }
            }
        }
        if cands.is_empty() {
            return Err(ShardError::QueryParse("IN predicate with no candidates".to_string()));
        }
        Ok(Predicate::In { value: self.new_value_expr(value)?, cands, has_not: false })
    }

    /// `[value, LIKE, pattern]`
    fn new_like_predicate(&self, node: &ParseNode) -> Result<Predicate> {
        let [value, _like, pattern] = Self::expect_children(node, "like predicate")?;
        Ok(Predicate::Like {
            value: self.new_value_expr(value)?,
            char_value: self.new_value_expr(pattern)?,
            has_not: false,
        })
    }

    /// `[value, IS, (NOT)?, NULL]`
    fn new_null_predicate(&self, node: &ParseNode) -> Result<Predicate> {
        let children = &node.children;
        if children.len() < 3 {
            return Err(ShardError::QueryParse("malformed null predicate".to_string()));
        }
        let has_not = children[2].text.eq_ignore_ascii_case("NOT");
        Ok(Predicate::Null { value: self.new_value_expr(&children[0])?, has_not })
    }

    /// Import a VALUE_EXP node into a value expression.
    fn new_value_expr(&self, node: &ParseNode) -> Result<ValueExprPtr> {
        let inner = if node.token == TokenType::ValueExp {
            node.children
                .first()
                .ok_or_else(|| ShardError::QueryParse("empty VALUE_EXP".to_string()))?
        } else {
            node
        };
        match inner.token {
            TokenType::Ident => Ok(ValueExpr::column(inner.text.clone())),
            TokenType::Literal => Ok(ValueExpr::literal(inner.text.clone())),
            _ => Err(ShardError::QueryParse(format!(
                "unsupported value expression token: {:?}",
                inner.token
            ))),
        }
    }

    fn expect_children<'a, const N: usize>(
        node: &'a ParseNode,
        what: &str,
    ) -> Result<[&'a ParseNode; N]> {
        if node.children.len() != N {
            return Err(ShardError::QueryParse(format!(
                "malformed {}: expected {} children, found {}",
                what,
                N,
                node.children.len()
            )));
        }
        let mut iter = node.children.iter();
        Ok(std::array::from_fn(|_| iter.next().expect("length checked")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn between_node(column: &str, lo: &str, hi: &str) -> ParseNode {
        ParseNode::with_children(
            TokenType::BetweenPredicate,
            "",
            vec![
                ParseNode::value_exp(ParseNode::ident(column)),
                ParseNode::word("BETWEEN"),
                ParseNode::value_exp(ParseNode::literal(lo)),
                ParseNode::word("AND"),
                ParseNode::value_exp(ParseNode::literal(hi)),
            ],
        )
    }

    fn in_node(column: &str, cands: &[&str]) -> ParseNode {
        let mut children = vec![
            ParseNode::value_exp(ParseNode::ident(column)),
            ParseNode::word("IN"),
            ParseNode::new(TokenType::LeftParen, "("),
        ];
        for (i, cand) in cands.iter().enumerate() {
            if i > 0 {
                children.push(ParseNode::new(TokenType::Comma, ","));
            }
            children.push(ParseNode::value_exp(ParseNode::literal(*cand)));
        }
        children.push(ParseNode::new(TokenType::RightParen, ")"));
        ParseNode::with_children(TokenType::InPredicate, "", children)
    }

    #[test]
    fn test_import_and_render_between_and_in() {
        // WHERE a BETWEEN 1 AND 2 AND b IN (3,4)
        let tree = ParseNode::with_children(
            TokenType::AndOp,
            "",
            vec![
                ParseNode::with_children(
                    TokenType::BooleanFactor,
                    "",
                    vec![between_node("a", "1", "2")],
                ),
                ParseNode::word("AND"),
                ParseNode::with_children(
                    TokenType::BooleanFactor,
                    "",
                    vec![in_node("b", &["3", "4"])],
                ),
            ],
        );
        let term = BoolTermFactory::new().new_bool_term(&tree).unwrap();
        assert_eq!(term.sql(), "a BETWEEN 1 AND 2 AND b IN ( 3 , 4 )");
    }

    #[test]
    fn test_comp_predicate_round_trip() {
        let factory = BoolTermFactory::new();
        for op in ["=", "<", ">", "<=", ">=", "<>", "!="] {
            let node = ParseNode::with_children(
                TokenType::CompPredicate,
                "",
                vec![
                    ParseNode::value_exp(ParseNode::ident("x")),
                    ParseNode::new(TokenType::CompOp, op),
                    ParseNode::value_exp(ParseNode::literal("7")),
                ],
            );
            let factor = ParseNode::with_children(TokenType::BooleanFactor, "", vec![node]);
            let term = factory.new_bool_term(&factor).unwrap();
            assert_eq!(term.sql(), format!("x {} 7", op));
        }
    }

    #[test]
    fn test_unsupported_predicates_fail_fast() {
        let factory = BoolTermFactory::new();
        for token in [
            TokenType::QuantifiedCompPredicate,
            TokenType::MatchPredicate,
            TokenType::OverlapsPredicate,
        ] {
            let factor = ParseNode::with_children(
                TokenType::BooleanFactor,
                "",
                vec![ParseNode::new(token, "")],
            );
            let err = factory.new_bool_term(&factor).unwrap_err();
            assert!(err.to_string().contains("unsupported"), "{:?} not rejected", token);
        }
    }

    #[test]
    fn test_value_exp_in_factor_rejected() {
        let factory = BoolTermFactory::new();
        let factor = ParseNode::with_children(
            TokenType::BooleanFactor,
            "",
            vec![ParseNode::value_exp(ParseNode::ident("oops"))],
        );
        assert!(factory.new_bool_term(&factor).is_err());
    }

    #[test]
    fn test_unknown_token_becomes_pass_term() {
        let factory = BoolTermFactory::new();
        let factor = ParseNode::with_children(
            TokenType::BooleanFactor,
            "",
            vec![ParseNode::word("CURRENT_TIMESTAMP")],
        );
        let term = factory.new_bool_term(&factor).unwrap();
        assert_eq!(term.sql(), "CURRENT_TIMESTAMP");
    }

    #[test]
    fn test_null_predicate_with_not() {
        let factory = BoolTermFactory::new();
        let node = ParseNode::with_children(
            TokenType::NullPredicate,
            "",
            vec![
                ParseNode::value_exp(ParseNode::ident("flux")),
                ParseNode::word("IS"),
                ParseNode::word("NOT"),
                ParseNode::word("NULL"),
            ],
        );
        let factor = ParseNode::with_children(TokenType::BooleanFactor, "", vec![node]);
        let term = factory.new_bool_term(&factor).unwrap();
        assert_eq!(term.sql(), "flux IS NOT NULL");
    }
}
