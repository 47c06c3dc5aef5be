//! 字段值：封闭的标签联合
//!
//! 所有消费者（谓词求值、动作执行、序列化）都对 FieldValue 做穷尽匹配；
//! 外部 JSON 通过 `FieldValue::from_json` 按字段类型校验后进入状态。

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::template::FieldType;

/// 运行期字段值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// 已校验属于枚举集合的取值
    Enum(String),
    List(Vec<FieldValue>),
}

/// 值与类型不匹配
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("'{value}' is not one of [{}]", allowed.join(", "))]
    InvalidEnum { value: String, allowed: Vec<String> },
}

impl FieldValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "str",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Enum(_) => "enum",
            Self::List(_) => "list",
        }
    }

    /// 文本视图（String / Enum）
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Enum(s) => Some(s),
            _ => None,
        }
    }

    /// 数值视图（Int / Float）
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// 无类型推断：JSON null 与对象（包括列表中的）没有对应的字段值
    pub fn infer(json: &Value) -> Option<FieldValue> {
        match json {
            Value::Null | Value::Object(_) => None,
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Int(i)),
                None => n.as_f64().map(Self::Float),
            },
            Value::String(s) => Some(Self::String(s.clone())),
            // 任一元素无法推断则整个列表无效
            Value::Array(items) => items
                .iter()
                .map(Self::infer)
                .collect::<Option<Vec<_>>>()
                .map(Self::List),
        }
    }

    /// 按字段类型把外部 JSON 转为字段值
    pub fn from_json(ty: &FieldType, json: &Value) -> Result<FieldValue, ValueError> {
        match Self::infer(json) {
            Some(value) => value.conform(ty),
            None => Err(ValueError::TypeMismatch {
                expected: ty.to_string(),
                found: json_type_name(json).to_string(),
            }),
        }
    }

    /// 将值规整为字段类型：Int → Float 提升、数字字符串解析、枚举大小写归一、标量包装为单元素列表
    pub fn conform(self, ty: &FieldType) -> Result<FieldValue, ValueError> {
        let mismatch = |found: &FieldValue| ValueError::TypeMismatch {
            expected: ty.to_string(),
            found: found.type_name().to_string(),
        };
        match (ty, self) {
            (FieldType::String, FieldValue::String(s)) => Ok(FieldValue::String(s)),
            (FieldType::String, FieldValue::Enum(s)) => Ok(FieldValue::String(s)),
            (FieldType::Int, FieldValue::Int(i)) => Ok(FieldValue::Int(i)),
            (FieldType::Int, FieldValue::Float(f)) if f.fract() == 0.0 => Ok(FieldValue::Int(f as i64)),
            (FieldType::Int, v @ FieldValue::String(_)) => match v.as_text().and_then(|s| s.trim().parse::<i64>().ok()) {
                Some(i) => Ok(FieldValue::Int(i)),
                None => Err(mismatch(&v)),
            },
            (FieldType::Float, FieldValue::Float(f)) => Ok(FieldValue::Float(f)),
            (FieldType::Float, FieldValue::Int(i)) => Ok(FieldValue::Float(i as f64)),
            (FieldType::Float, v @ FieldValue::String(_)) => match v.as_text().and_then(|s| s.trim().parse::<f64>().ok()) {
                Some(f) => Ok(FieldValue::Float(f)),
                None => Err(mismatch(&v)),
            },
            (FieldType::Bool | FieldType::Confirm, FieldValue::Bool(b)) => Ok(FieldValue::Bool(b)),
            (FieldType::Bool | FieldType::Confirm, v @ FieldValue::String(_)) => {
                match v.as_text().map(|s| s.trim().to_ascii_lowercase()).as_deref() {
                    Some("true" | "yes") => Ok(FieldValue::Bool(true)),
                    Some("false" | "no") => Ok(FieldValue::Bool(false)),
                    _ => Err(mismatch(&v)),
                }
            }
            (FieldType::Enum(allowed), FieldValue::String(s) | FieldValue::Enum(s)) => {
                match allowed.iter().find(|a| a.eq_ignore_ascii_case(s.trim())) {
                    Some(canonical) => Ok(FieldValue::Enum(canonical.clone())),
                    None => Err(ValueError::InvalidEnum {
                        value: s,
                        allowed: allowed.clone(),
                    }),
                }
            }
            (FieldType::List(inner), FieldValue::List(items)) => items
                .into_iter()
                .map(|item| item.conform(inner))
                .collect::<Result<Vec<_>, _>>()
                .map(FieldValue::List),
            (FieldType::List(inner), scalar) => Ok(FieldValue::List(vec![scalar.conform(inner)?])),
            (_, other) => Err(mismatch(&other)),
        }
    }

    /// 转为 JSON（外部 API 参数）
    pub fn to_json(&self) -> Value {
        match self {
            Self::String(s) | Self::Enum(s) => Value::String(s.clone()),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => Value::from(*f),
            Self::Bool(b) => Value::Bool(*b),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) | Self::Enum(s) => write!(f, "{s}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::List(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

fn json_type_name(json: &Value) -> &'static str {
    match json {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
