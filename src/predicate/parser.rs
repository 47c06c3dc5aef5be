//! 受限表达式语法（nom）
//!
//! ```text
//! expr     := or
//! or       := and (("or" | "||") and)*
//! and      := not (("and" | "&&") not)*
//! not      := ("not" | "!") not | compare
//! compare  := operand (op operand)?
//! op       := == != <= >= < > in "not in"
//! operand  := "(" expr ")" | "[" expr,* "]" | literal | builtin "(" ref ")" | ref
//! ref      := ident ("." ident)?
//! ```
//!
//! 语法中没有赋值与任意调用，规格文件无法借表达式执行代码。

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, multispace1},
    combinator::{all_consuming, map, map_opt, not, opt, recognize, value, verify},
    error::{context, convert_error, VerboseError},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

use crate::state::FieldValue;

pub(crate) type Res<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

const KEYWORDS: &[&str] = &["and", "or", "not", "in", "true", "false", "none", "null"];

/// 字段引用：`field` 或 `Worksheet.field`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub worksheet: Option<String>,
    pub field: String,
}

impl std::fmt::Display for FieldRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.worksheet {
            Some(ws) => write!(f, "{ws}.{}", self.field),
            None => write!(f, "{}", self.field),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Value(FieldValue),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl CmpOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
        }
    }
}

/// 内置谓词函数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    IsSet,
    IsUnset,
    Confirmed,
}

impl Builtin {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "is_set" => Some(Self::IsSet),
            "is_unset" => Some(Self::IsUnset),
            "confirmed" => Some(Self::Confirmed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Ref(FieldRef),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    Call(Builtin, FieldRef),
}

impl Expr {
    /// 收集表达式中出现的全部字段引用
    pub fn references<'a>(&'a self, out: &mut Vec<&'a FieldRef>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ref(r) | Expr::Call(_, r) => out.push(r),
            Expr::List(items) => items.iter().for_each(|i| i.references(out)),
            Expr::Not(inner) => inner.references(out),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(a, _, b) => {
                a.references(out);
                b.references(out);
            }
        }
    }
}

/// 解析完整表达式
pub fn parse_expr(input: &str) -> Result<Expr, String> {
    match all_consuming(delimited(multispace0, expr, multispace0))(input) {
        Ok((_, e)) => Ok(e),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(convert_error(input, e)),
        Err(nom::Err::Incomplete(_)) => Err("Incomplete input".to_string()),
    }
}

pub(crate) fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> Res<'a, O>
where
    F: FnMut(&'a str) -> Res<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

pub(crate) fn identifier(input: &str) -> Res<'_, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

/// 关键字：整词匹配，`notes` 不会被当成 `not`
pub(crate) fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> Res<'a, &'a str> {
    verify(identifier, move |s: &str| s.eq_ignore_ascii_case(kw))
}

fn is_keyword(s: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(s))
}

/// `=` 但不是 `==`
pub(crate) fn assign_op(input: &str) -> Res<'_, char> {
    ws(terminated(char('='), not(char('='))))(input)
}

pub(crate) fn expr(input: &str) -> Res<'_, Expr> {
    or_expr(input)
}

fn or_expr(input: &str) -> Res<'_, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(ws(alt((keyword("or"), tag("||")))), and_expr))(input)?;
    let folded = rest
        .into_iter()
        .fold(first, |acc, rhs| Expr::Or(Box::new(acc), Box::new(rhs)));
    Ok((input, folded))
}

fn and_expr(input: &str) -> Res<'_, Expr> {
    let (input, first) = not_expr(input)?;
    let (input, rest) = many0(preceded(ws(alt((keyword("and"), tag("&&")))), not_expr))(input)?;
    let folded = rest
        .into_iter()
        .fold(first, |acc, rhs| Expr::And(Box::new(acc), Box::new(rhs)));
    Ok((input, folded))
}

fn not_expr(input: &str) -> Res<'_, Expr> {
    alt((
        map(
            preceded(ws(alt((keyword("not"), tag("!")))), not_expr),
            |e| Expr::Not(Box::new(e)),
        ),
        cmp_expr,
    ))(input)
}

fn cmp_op(input: &str) -> Res<'_, CmpOp> {
    alt((
        value(CmpOp::Eq, tag("==")),
        value(CmpOp::Ne, tag("!=")),
        value(CmpOp::Le, tag("<=")),
        value(CmpOp::Ge, tag(">=")),
        value(CmpOp::Lt, tag("<")),
        value(CmpOp::Gt, tag(">")),
        value(
            CmpOp::NotIn,
            tuple((keyword("not"), multispace1, keyword("in"))),
        ),
        value(CmpOp::In, keyword("in")),
    ))(input)
}

fn cmp_expr(input: &str) -> Res<'_, Expr> {
    let (input, left) = operand(input)?;
    let (input, tail) = opt(pair(ws(cmp_op), operand))(input)?;
    let e = match tail {
        Some((op, right)) => Expr::Compare(Box::new(left), op, Box::new(right)),
        None => left,
    };
    Ok((input, e))
}

fn operand(input: &str) -> Res<'_, Expr> {
    ws(alt((
        delimited(char('('), expr, ws(char(')'))),
        map(
            delimited(
                char('['),
                separated_list0(ws(char(',')), expr),
                ws(char(']')),
            ),
            Expr::List,
        ),
        map(literal, Expr::Literal),
        builtin_call,
        map(field_ref, Expr::Ref),
    )))(input)
}

pub(crate) fn string_literal(input: &str) -> Res<'_, String> {
    context(
        "string",
        alt((
            map(
                delimited(char('"'), take_while(|c| c != '"'), char('"')),
                |s: &str| s.to_string(),
            ),
            map(
                delimited(char('\''), take_while(|c| c != '\''), char('\'')),
                |s: &str| s.to_string(),
            ),
        )),
    )(input)
}

fn number(input: &str) -> Res<'_, FieldValue> {
    map_opt(
        recognize(tuple((opt(char('-')), digit1, opt(pair(char('.'), digit1))))),
        |s: &str| {
            if s.contains('.') {
                s.parse::<f64>().ok().map(FieldValue::Float)
            } else {
                s.parse::<i64>().ok().map(FieldValue::Int)
            }
        },
    )(input)
}

fn literal(input: &str) -> Res<'_, Literal> {
    alt((
        map(string_literal, |s| Literal::Value(FieldValue::String(s))),
        map(number, Literal::Value),
        value(Literal::Value(FieldValue::Bool(true)), keyword("true")),
        value(Literal::Value(FieldValue::Bool(false)), keyword("false")),
        value(Literal::Null, alt((keyword("none"), keyword("null")))),
    ))(input)
}

fn builtin_call(input: &str) -> Res<'_, Expr> {
    map(
        pair(
            map_opt(identifier, Builtin::lookup),
            delimited(ws(char('(')), field_ref, ws(char(')'))),
        ),
        |(b, r)| Expr::Call(b, r),
    )(input)
}

fn name_part(input: &str) -> Res<'_, &str> {
    verify(identifier, |s: &str| !is_keyword(s))(input)
}

pub(crate) fn field_ref(input: &str) -> Res<'_, FieldRef> {
    map(
        pair(name_part, opt(preceded(char('.'), name_part))),
        |(first, second): (&str, Option<&str>)| match second {
            Some(field) => FieldRef {
                worksheet: Some(first.to_string()),
                field: field.to_string(),
            },
            None => FieldRef {
                worksheet: None,
                field: first.to_string(),
            },
        },
    )(input)
}
