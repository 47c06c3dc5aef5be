//! 工作表模板类型定义
//!
//! WorksheetTemplate / FieldTemplate / ActionSpec 在加载期构建，运行期只读，由所有会话共享。

use std::fmt;

use crate::action::Statement;
use crate::predicate::Predicate;
use crate::state::FieldValue;

/// 工作表种类：任务 或 知识库
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorksheetKind {
    /// 任务型工作表，运行期实例化为 TaskRecord
    Task,
    /// 知识库工作表，字段描述数据库的列
    KnowledgeBase,
}

impl WorksheetKind {
    /// 解析表格中的 kind 列（task / worksheet / kb / db / knowledge_base）
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "task" | "worksheet" | "ws" => Some(Self::Task),
            "kb" | "db" | "knowledge_base" | "knowledgebase" => Some(Self::KnowledgeBase),
            _ => None,
        }
    }
}

/// 字段种类：用户输入 / 内部 / 输出
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Input,
    Internal,
    Output,
}

impl FieldKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "input" => Some(Self::Input),
            "internal" => Some(Self::Internal),
            "output" => Some(Self::Output),
            _ => None,
        }
    }
}

/// 字段类型
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// 枚举：值必须属于声明的集合
    Enum(Vec<String>),
    /// 确认型字段，取值为布尔
    Confirm,
    List(Box<FieldType>),
}

impl FieldType {
    /// 解析类型名；`enum` 需配合 values，`list[T]` / `list<T>` 递归解析元素类型
    pub fn parse(raw: &str, values: &[String]) -> Option<Self> {
        let raw = raw.trim();
        let lower = raw.to_ascii_lowercase();
        let inner = lower
            .strip_prefix("list[")
            .and_then(|s| s.strip_suffix(']'))
            .or_else(|| lower.strip_prefix("list<").and_then(|s| s.strip_suffix('>')));
        if let Some(inner) = inner {
            return Self::parse(inner, values).map(|t| Self::List(Box::new(t)));
        }
        match lower.as_str() {
            "str" | "string" | "text" | "" => Some(Self::String),
            "int" | "integer" => Some(Self::Int),
            "float" | "number" | "double" => Some(Self::Float),
            "bool" | "boolean" => Some(Self::Bool),
            "confirm" => Some(Self::Confirm),
            "enum" => Some(Self::Enum(values.to_vec())),
            "list" => Some(Self::List(Box::new(Self::String))),
            _ => None,
        }
    }

    pub fn enum_values(&self) -> Option<&[String]> {
        match self {
            Self::Enum(values) => Some(values),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "str"),
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::Bool => write!(f, "bool"),
            Self::Confirm => write!(f, "confirm"),
            Self::Enum(values) => write!(f, "Enum[{}]", values.join(", ")),
            Self::List(inner) => write!(f, "List[{inner}]"),
        }
    }
}

/// 已解析的动作：id 用于「每个 TaskRecord 至多执行一次」的幂等保护
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub id: String,
    /// 原始文本（日志与错误信息用）
    pub source: String,
    pub statements: Vec<Statement>,
}

/// 字段模板
#[derive(Debug, Clone)]
pub struct FieldTemplate {
    pub name: String,
    pub kind: FieldKind,
    pub ty: FieldType,
    pub predicate: Predicate,
    pub description: String,
    pub dont_ask: bool,
    pub required: bool,
    pub needs_confirmation: bool,
    /// 未赋值时谓词求值使用的默认值
    pub default: Option<FieldValue>,
    pub primary_key: bool,
    pub actions: Vec<ActionSpec>,
}

impl FieldTemplate {
    /// needsConfirmation 或 Confirm 类型都需要用户确认
    pub fn requires_confirmation(&self) -> bool {
        self.needs_confirmation || self.ty == FieldType::Confirm
    }

    /// 可以向用户提问的字段
    pub fn is_askable(&self) -> bool {
        self.kind == FieldKind::Input && !self.dont_ask
    }

    /// 任务完成前必须解决（填写或被用户明确拒绝）的字段
    pub fn blocks_completion(&self) -> bool {
        self.required && self.is_askable()
    }

    /// AskField 使用的描述；枚举字段附带可选项
    pub fn ask_description(&self) -> String {
        match self.ty.enum_values() {
            Some(values) if !values.is_empty() => {
                let options = values.join(", ");
                if self.description.is_empty() {
                    format!("Options are: {options}")
                } else {
                    format!("{} Options are: {options}", self.description)
                }
            }
            _ => self.description.clone(),
        }
    }
}

/// 工作表模板
#[derive(Debug, Clone)]
pub struct WorksheetTemplate {
    pub name: String,
    pub kind: WorksheetKind,
    pub description: String,
    pub predicate: Predicate,
    /// 是否允许焦点栈上同时存在多个实例
    pub allow_concurrent: bool,
    pub fields: Vec<FieldTemplate>,
    pub actions: Vec<ActionSpec>,
}

impl WorksheetTemplate {
    pub fn field(&self, name: &str) -> Option<&FieldTemplate> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_task(&self) -> bool {
        self.kind == WorksheetKind::Task
    }

    /// 字段动作与工作表动作的总数（用于策略轮数上限）
    pub fn action_count(&self) -> usize {
        self.actions.len() + self.fields.iter().map(|f| f.actions.len()).sum::<usize>()
    }
}
