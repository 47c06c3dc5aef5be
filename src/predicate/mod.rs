//! 谓词：受限表达式语法 + 三值求值

pub mod eval;
pub mod parser;

pub use eval::{EvalContext, Truth};
pub use parser::{parse_expr, Builtin, CmpOp, Expr, FieldRef, Literal};

use crate::state::FieldValue;

/// 已解析的谓词；空串与 `TRUE` 表示恒真
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    source: String,
    expr: Expr,
}

impl Predicate {
    pub fn always() -> Self {
        Self {
            source: String::new(),
            expr: Expr::Literal(Literal::Value(FieldValue::Bool(true))),
        }
    }

    pub fn parse(source: &str) -> Result<Self, String> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Ok(Self::always());
        }
        Ok(Self {
            source: trimmed.to_string(),
            expr: parse_expr(trimmed)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Self::always()
    }
}
