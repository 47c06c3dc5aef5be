//! 运行期记录：TaskRecord（工作表实例）与 KBQueryRecord（知识库查询）

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::knowledge::KBAnswer;
use crate::state::FieldValue;
use crate::template::{FieldTemplate, WorksheetTemplate};

/// 任务由谁发起
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Initiator {
    #[default]
    User,
    Agent,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 代理提议、等待用户接受
    Proposed,
    InProgress,
    /// 有字段等待用户确认
    AwaitingConfirmation,
    Completed,
    Abandoned,
}

/// 工作表实例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    /// 模板名（模板本身在 TemplateRegistry 中）
    pub template: String,
    #[serde(default)]
    pub values: BTreeMap<String, FieldValue>,
    pub initiator: Initiator,
    pub status: TaskStatus,
    #[serde(default)]
    pub confirmed: BTreeSet<String>,
    #[serde(default)]
    pub pending_confirmation: BTreeSet<String>,
    /// 用户明确表示不提供的字段
    #[serde(default)]
    pub declined: BTreeSet<String>,
    #[serde(default)]
    pub actions_executed: BTreeSet<String>,
    #[serde(default)]
    pub failed_actions: BTreeSet<String>,
}

impl TaskRecord {
    pub fn new(template: &WorksheetTemplate, initiator: Initiator) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            template: template.name.clone(),
            values: BTreeMap::new(),
            initiator,
            status: match initiator {
                Initiator::User => TaskStatus::InProgress,
                Initiator::Agent => TaskStatus::Proposed,
            },
            confirmed: BTreeSet::new(),
            pending_confirmation: BTreeSet::new(),
            declined: BTreeSet::new(),
            actions_executed: BTreeSet::new(),
            failed_actions: BTreeSet::new(),
        }
    }

    pub fn value(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn is_set(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    /// 赋值；值发生变化时撤销已有确认。需确认且尚未确认的字段进入待确认集合，
    /// 不论值来自用户、提议还是动作
    pub fn assign(&mut self, field: &FieldTemplate, value: FieldValue) {
        if self.values.get(&field.name) != Some(&value) {
            self.confirmed.remove(&field.name);
            self.pending_confirmation.remove(&field.name);
        }
        self.declined.remove(&field.name);
        if field.requires_confirmation() && !self.confirmed.contains(&field.name) {
            self.pending_confirmation.insert(field.name.clone());
        }
        self.values.insert(field.name.clone(), value);
    }

    pub fn clear(&mut self, field: &str) {
        self.values.remove(field);
        self.confirmed.remove(field);
        self.pending_confirmation.remove(field);
    }

    /// 用户确认字段；未赋值的字段无法确认
    pub fn confirm(&mut self, field: &str) -> bool {
        if !self.is_set(field) {
            return false;
        }
        self.pending_confirmation.remove(field);
        self.confirmed.insert(field.to_string())
    }

    pub fn decline(&mut self, field: &str) {
        self.clear(field);
        self.declined.insert(field.to_string());
    }

    pub fn has_executed(&self, action_id: &str) -> bool {
        self.actions_executed.contains(action_id)
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.status, TaskStatus::Completed | TaskStatus::Abandoned)
    }

    pub fn is_proposed(&self) -> bool {
        self.status == TaskStatus::Proposed
    }

    /// 根据待确认集合在 InProgress 与 AwaitingConfirmation 之间切换
    pub fn refresh_status(&mut self) {
        self.status = match self.status {
            TaskStatus::InProgress if !self.pending_confirmation.is_empty() => {
                TaskStatus::AwaitingConfirmation
            }
            TaskStatus::AwaitingConfirmation if self.pending_confirmation.is_empty() => {
                TaskStatus::InProgress
            }
            other => other,
        };
    }
}

/// 知识库查询参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KBParameter {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub value: Option<FieldValue>,
}

/// 知识库查询记录；结果或错误写入后不再重跑
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KBQueryRecord {
    pub id: String,
    /// 知识库工作表名
    pub database: String,
    pub question: String,
    /// 形式化查询，`{param}` 占位由参数替换
    pub formal_query: String,
    #[serde(default)]
    pub parameters: Vec<KBParameter>,
    #[serde(default)]
    pub result: Option<KBAnswer>,
    #[serde(default)]
    pub error: Option<String>,
}

impl KBQueryRecord {
    pub fn new(database: &str, question: &str, formal_query: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            database: database.to_string(),
            question: question.to_string(),
            formal_query: formal_query.to_string(),
            parameters: Vec::new(),
            result: None,
            error: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }

    pub fn missing_parameter(&self) -> Option<&KBParameter> {
        self.parameters.iter().find(|p| p.value.is_none())
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut KBParameter> {
        self.parameters.iter_mut().find(|p| p.name == name)
    }

    /// 代入参数后的查询；仍有缺失参数时返回 None
    pub fn render_query(&self) -> Option<String> {
        let mut query = self.formal_query.clone();
        for p in &self.parameters {
            let value = p.value.as_ref()?;
            query = query.replace(&format!("{{{}}}", p.name), &value.to_string());
        }
        Some(query)
    }
}
