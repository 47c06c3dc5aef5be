//! 动作语句
//!
//! ```text
//! say(expr)                       字符串中的 {field} 用当前记录插值
//! report(expr, expr)
//! field = expr
//! field = call api(arg, name = expr, ...)
//! call api(...)
//! propose(Worksheet, field = expr, ...)
//! ```
//!
//! 语句之间以换行或 `;` 分隔（引号与括号内的分隔符不计）。

use nom::{
    branch::alt,
    character::complete::{char, multispace0},
    combinator::{all_consuming, map, opt},
    error::convert_error,
    multi::separated_list0,
    sequence::{delimited, pair, preceded, separated_pair, tuple},
};

use crate::predicate::parser::{assign_op, expr, identifier, keyword, ws, Res};
use crate::predicate::Expr;

/// 外部 API 调用参数
#[derive(Debug, Clone, PartialEq)]
pub struct CallArg {
    pub name: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Say(Expr),
    Report(Expr, Expr),
    Assign {
        field: String,
        value: Expr,
    },
    Call {
        target: Option<String>,
        api: String,
        args: Vec<CallArg>,
    },
    Propose {
        worksheet: String,
        values: Vec<(String, Expr)>,
    },
}

impl Statement {
    /// 语句写入的字段（赋值或 API 结果目标）
    pub fn target_field(&self) -> Option<&str> {
        match self {
            Statement::Assign { field, .. } => Some(field),
            Statement::Call {
                target: Some(field),
                ..
            } => Some(field),
            _ => None,
        }
    }

    /// 语句中出现的全部表达式
    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            Statement::Say(e) => vec![e],
            Statement::Report(q, a) => vec![q, a],
            Statement::Assign { value, .. } => vec![value],
            Statement::Call { args, .. } => args.iter().map(|a| &a.value).collect(),
            Statement::Propose { values, .. } => values.iter().map(|(_, e)| e).collect(),
        }
    }
}

/// 解析一段动作源码
pub fn parse_statements(source: &str) -> Result<Vec<Statement>, String> {
    split_statements(source)
        .into_iter()
        .map(parse_statement)
        .collect()
}

fn parse_statement(input: &str) -> Result<Statement, String> {
    match all_consuming(delimited(multispace0, statement, multispace0))(input) {
        Ok((_, s)) => Ok(s),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(convert_error(input, e)),
        Err(nom::Err::Incomplete(_)) => Err("Incomplete input".to_string()),
    }
}

/// 按顶层的 `;` 与换行切分
fn split_statements(source: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in source.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(' | '[') => depth += 1,
            (None, ')' | ']') => depth -= 1,
            (None, ';' | '\n') if depth <= 0 => {
                parts.push(&source[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&source[start..]);
    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

fn statement(input: &str) -> Res<'_, Statement> {
    alt((say, report, propose, call_statement, assignment))(input)
}

fn parens<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> Res<'a, O>
where
    F: FnMut(&'a str) -> Res<'a, O>,
{
    delimited(ws(char('(')), inner, ws(char(')')))
}

fn say(input: &str) -> Res<'_, Statement> {
    map(preceded(keyword("say"), parens(expr)), Statement::Say)(input)
}

fn report(input: &str) -> Res<'_, Statement> {
    map(
        preceded(
            keyword("report"),
            parens(separated_pair(expr, ws(char(',')), expr)),
        ),
        |(q, a)| Statement::Report(q, a),
    )(input)
}

fn named_value(input: &str) -> Res<'_, (String, Expr)> {
    map(
        separated_pair(ws(identifier), assign_op, expr),
        |(name, value)| (name.to_string(), value),
    )(input)
}

fn propose(input: &str) -> Res<'_, Statement> {
    map(
        preceded(
            keyword("propose"),
            parens(pair(
                ws(identifier),
                opt(preceded(
                    ws(char(',')),
                    separated_list0(ws(char(',')), named_value),
                )),
            )),
        ),
        |(worksheet, values)| Statement::Propose {
            worksheet: worksheet.to_string(),
            values: values.unwrap_or_default(),
        },
    )(input)
}

fn call_arg(input: &str) -> Res<'_, (Option<String>, Expr)> {
    alt((
        map(named_value, |(name, value)| (Some(name), value)),
        map(expr, |value| (None, value)),
    ))(input)
}

/// `call api(args)`；位置参数以引用的字段名命名，其余为 argN
fn api_call(input: &str) -> Res<'_, (String, Vec<CallArg>)> {
    map(
        tuple((
            keyword("call"),
            ws(identifier),
            parens(separated_list0(ws(char(',')), call_arg)),
        )),
        |(_, api, raw)| {
            let args = raw
                .into_iter()
                .enumerate()
                .map(|(i, (name, value))| {
                    let name = name.unwrap_or_else(|| match &value {
                        Expr::Ref(r) => r.field.clone(),
                        _ => format!("arg{i}"),
                    });
                    CallArg { name, value }
                })
                .collect();
            (api.to_string(), args)
        },
    )(input)
}

fn call_statement(input: &str) -> Res<'_, Statement> {
    map(api_call, |(api, args)| Statement::Call {
        target: None,
        api,
        args,
    })(input)
}

fn assignment(input: &str) -> Res<'_, Statement> {
    let (input, field) = ws(identifier)(input)?;
    let (input, _) = assign_op(input)?;
    alt((
        map(api_call, |(api, args)| Statement::Call {
            target: Some(field.to_string()),
            api,
            args,
        }),
        map(expr, |value| Statement::Assign {
            field: field.to_string(),
            value,
        }),
    ))(input)
}
