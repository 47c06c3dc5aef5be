//! 引擎错误类型
//!
//! 与 RecoveryEngine 配合：SpecError 在加载期致命；MergeError 由外部增量触发，状态保持不变并上报；
//! ActionError / KnowledgeError 在策略扫描中被转换为 Report / Say，不会中断本轮。

use thiserror::Error;

use crate::state::ValueError;

/// 工作表定义错误（加载期致命，不会进入运行期）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpecError {
    #[error("Worksheet name must not be empty")]
    EmptyName,

    #[error("Worksheet {0} has a field without a name")]
    EmptyFieldName(String),

    #[error("Unknown worksheet kind '{kind}' in {worksheet}")]
    UnknownKind { worksheet: String, kind: String },

    #[error("Duplicate field {worksheet}.{field}")]
    DuplicateField { worksheet: String, field: String },

    #[error("Unknown field type '{ty}' for {worksheet}.{field}")]
    UnknownFieldType {
        worksheet: String,
        field: String,
        ty: String,
    },

    #[error("Unknown field kind '{kind}' for {worksheet}.{field}")]
    UnknownFieldKind {
        worksheet: String,
        field: String,
        kind: String,
    },

    #[error("Enum field {worksheet}.{field} declares no values")]
    EmptyEnum { worksheet: String, field: String },

    #[error("Invalid default for {worksheet}.{field}: {reason}")]
    InvalidDefault {
        worksheet: String,
        field: String,
        reason: String,
    },

    #[error("Invalid predicate on {owner}: {reason}")]
    InvalidPredicate { owner: String, reason: String },

    #[error("Invalid action on {owner}: {reason}")]
    InvalidAction { owner: String, reason: String },

    #[error("Duplicate action id '{id}' in {worksheet}")]
    DuplicateActionId { worksheet: String, id: String },

    #[error("{owner} references unknown field or worksheet '{target}'")]
    UnknownReference { owner: String, target: String },

    #[error("Cannot read worksheet spec: {0}")]
    Io(String),

    #[error("Cannot parse worksheet spec: {0}")]
    Parse(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// 模板注册表错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Worksheet '{0}' is already registered")]
    DuplicateTemplate(String),

    #[error("Unknown worksheet '{0}'")]
    UnknownTemplate(String),
}

/// 增量合并错误：合并是全有或全无的，出错时对话状态与合并前完全一致
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MergeError {
    #[error("Type mismatch for {task}.{field}: expected {expected}, found {found}")]
    TypeMismatch {
        task: String,
        field: String,
        expected: String,
        found: String,
    },

    #[error("Invalid value '{value}' for {task}.{field}, allowed: [{}]", allowed.join(", "))]
    InvalidEnumValue {
        task: String,
        field: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("Worksheet '{0}' already has an active task")]
    DuplicateActiveTask(String),

    #[error("Unknown field {task}.{field}")]
    UnknownField { task: String, field: String },

    #[error("No active task for '{0}'")]
    TaskNotActive(String),

    #[error("No task in focus")]
    NoFocusTask,

    #[error("Worksheet '{0}' is not a task worksheet")]
    NotATask(String),

    #[error("Worksheet '{0}' is not a knowledge base")]
    NotAKnowledgeBase(String),

    #[error("Unknown knowledge base query '{0}'")]
    UnknownKbRecord(String),

    #[error("Unknown parameter '{name}' for knowledge base query '{record}'")]
    UnknownKbParameter { record: String, name: String },

    #[error("Knowledge base query '{0}' already has a result")]
    KbRecordFinalized(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl MergeError {
    /// 把字段级 ValueError 补上任务与字段名
    pub fn from_value(task: &str, field: &str, err: ValueError) -> Self {
        match err {
            ValueError::TypeMismatch { expected, found } => Self::TypeMismatch {
                task: task.to_string(),
                field: field.to_string(),
                expected,
                found,
            },
            ValueError::InvalidEnum { value, allowed } => Self::InvalidEnumValue {
                task: task.to_string(),
                field: field.to_string(),
                value,
                allowed,
            },
        }
    }
}

/// 谓词求值错误（调用方记录日志后按 False 处理）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PredicateError {
    #[error("Expected a boolean, found {0}")]
    NotBoolean(String),

    #[error("Cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        op: String,
        left: String,
        right: String,
    },

    #[error("Unknown field '{0}'")]
    UnknownField(String),

    #[error("Predicate cycle detected at '{0}'")]
    Cycle(String),
}

/// 动作执行错误（由 RecoveryEngine 转为 Report / Say）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("Unknown external API: {0}")]
    UnknownApi(String),

    #[error("External API '{api}' failed: {message}")]
    ApiFailed { api: String, message: String },

    #[error("External API timeout: {0}")]
    Timeout(String),

    #[error("Cannot assign {field}: {reason}")]
    InvalidAssignment { field: String, reason: String },

    #[error("Expression needs unset field(s): {0}")]
    Unresolved(String),

    #[error("Unknown worksheet in proposal: {0}")]
    UnknownTemplate(String),

    #[error(transparent)]
    Predicate(#[from] PredicateError),
}

/// 知识库查询错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KnowledgeError {
    #[error("No knowledge base is configured")]
    NotConfigured,

    #[error("Knowledge base query timed out")]
    Timeout,

    #[error("Knowledge base query failed: {0}")]
    QueryFailed(String),
}

/// 会话层统一错误
#[derive(Error, Debug)]
pub enum WorksheetError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("Semantic parser error: {0}")]
    Parser(String),

    #[error("Response generator error: {0}")]
    Responder(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}
