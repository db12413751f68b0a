// Value-expression and column-ref primitives, the leaves of the WHERE DAG.

use std::fmt;
use std::sync::Arc;

use crate::query::template::QueryTemplate;

/// Shared handle to a value expression. Rewrites that substitute operands in
/// place rely on the reference identity of these handles (`copy_syntax`),
/// while deep clones allocate fresh ones.
pub type ValueExprPtr = Arc<ValueExpr>;

/// A (possibly qualified) column reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnRef {
    pub db: String,
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(db: impl Into<String>, table: impl Into<String>, column: impl Into<String>) -> Self {
        Self { db: db.into(), table: table.into(), column: column.into() }
    }

    pub fn column(column: impl Into<String>) -> Self {
        Self::new("", "", column)
    }

    /// SQL text of this reference, qualifiers omitted when empty.
    pub fn sql(&self) -> String {
        let mut out = String::new();
        if !self.db.is_empty() {
            out.push_str(&self.db);
            out.push('.');
        }
        if !self.table.is_empty() {
            out.push_str(&self.table);
            out.push('.');
        }
        out.push_str(&self.column);
        out
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())
    }
}

/// A value expression: a predicate operand.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpr {
    Column(ColumnRef),
    /// Literal token carried verbatim (numbers keep their source spelling)
    Literal(String),
    Function { name: String, args: Vec<ValueExprPtr> },
    Star,
}

impl ValueExpr {
    pub fn column(name: impl Into<String>) -> ValueExprPtr {
        Arc::new(ValueExpr::Column(ColumnRef::column(name)))
    }

    pub fn literal(text: impl Into<String>) -> ValueExprPtr {
        Arc::new(ValueExpr::Literal(text.into()))
    }

    /// Deep copy: the returned handle shares no nodes with `self`.
    pub fn clone_deep(&self) -> ValueExprPtr {
        match self {
            ValueExpr::Column(c) => Arc::new(ValueExpr::Column(c.clone())),
            ValueExpr::Literal(s) => Arc::new(ValueExpr::Literal(s.clone())),
            ValueExpr::Function { name, args } => Arc::new(ValueExpr::Function {
                name: name.clone(),
                args: args.iter().map(|a| a.clone_deep()).collect(),
            }),
            ValueExpr::Star => Arc::new(ValueExpr::Star),
        }
    }

    /// Append every column reference reachable from this expression.
    pub fn find_column_refs(&self, out: &mut Vec<ColumnRef>) {
        match self {
            ValueExpr::Column(c) => out.push(c.clone()),
            ValueExpr::Function { args, .. } => {
                for arg in args {
                    arg.find_column_refs(out);
                }
            }
            ValueExpr::Literal(_) | ValueExpr::Star => {}
        }
    }

    pub fn render_to(&self, qt: &mut QueryTemplate) {
        match self {
            ValueExpr::Column(c) => qt.append(c.sql()),
            ValueExpr::Literal(s) => qt.append(s.clone()),
            ValueExpr::Function { name, args } => {
                qt.append(format!("{}(", name));
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        qt.append(",");
                    }
                    arg.render_to(qt);
                }
                qt.append(")");
            }
            ValueExpr::Star => qt.append("*"),
        }
    }
}

/// Renders a sequence of value expressions into a template, optionally
/// comma-separating successive items (IN lists).
pub struct ValueExprRenderer<'a> {
    qt: &'a mut QueryTemplate,
    comma_separated: bool,
    count: usize,
}

impl<'a> ValueExprRenderer<'a> {
    pub fn new(qt: &'a mut QueryTemplate, comma_separated: bool) -> Self {
        Self { qt, comma_separated, count: 0 }
    }

    pub fn render(&mut self, expr: &ValueExpr) {
        self.count += 1;
        if self.comma_separated && self.count > 1 {
            self.qt.append(",");
        }
        expr.render_to(self.qt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_ref_sql() {
        assert_eq!(ColumnRef::column("ra").sql(), "ra");
        assert_eq!(ColumnRef::new("", "Obj", "decl").sql(), "Obj.decl");
        assert_eq!(ColumnRef::new("LSST", "Obj", "decl").sql(), "LSST.Obj.decl");
    }

    #[test]
    fn test_clone_deep_is_disjoint() {
        let original = ValueExpr::column("flux");
        let copy = original.clone_deep();
        assert_eq!(*original, *copy);
        assert!(!Arc::ptr_eq(&original, &copy));
    }

    #[test]
    fn test_find_column_refs_through_function() {
        let expr = ValueExpr::Function {
            name: "scisql_fluxToAbMag".to_string(),
            args: vec![ValueExpr::column("gFlux"), ValueExpr::literal("2")],
        };
        let mut refs = Vec::new();
        expr.find_column_refs(&mut refs);
        assert_eq!(refs, vec![ColumnRef::column("gFlux")]);
    }
}
