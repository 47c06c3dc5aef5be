//! 状态增量：语义解析器对一句用户话语的结构化解读
//!
//! 所有字段都可省略；JSON 形如
//! `{"new_tasks":[{"worksheet":"BookRestaurant","values":{"restaurant":"Nice Place"}}]}`。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::Initiator;

/// 新建任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProposal {
    pub worksheet: String,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
    #[serde(default)]
    pub initiator: Initiator,
}

/// 字段赋值；task 为空时指向当前焦点任务，null 值表示清空
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldAssignment {
    #[serde(default)]
    pub task: Option<String>,
    pub field: String,
    pub value: Value,
}

/// 字段定位（确认 / 否认 / 拒答）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTarget {
    #[serde(default)]
    pub task: Option<String>,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KBParameterSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub value: Option<Value>,
}

/// 新的知识库查询
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KBQueryProposal {
    pub database: String,
    pub question: String,
    pub formal_query: String,
    #[serde(default)]
    pub parameters: Vec<KBParameterSpec>,
}

/// 为已有查询补参数；record 为记录 id 或问题原文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KBParameterAssignment {
    pub record: String,
    pub name: String,
    pub value: Value,
}

/// 一次合并的全部变更；合并顺序与字段声明顺序一致
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    #[serde(default)]
    pub new_tasks: Vec<TaskProposal>,
    /// 接受代理提议的工作表（按名）
    #[serde(default)]
    pub accept_proposals: Vec<String>,
    #[serde(default)]
    pub reject_proposals: Vec<String>,
    #[serde(default)]
    pub assignments: Vec<FieldAssignment>,
    #[serde(default)]
    pub confirmations: Vec<FieldTarget>,
    /// 用户否认：清空值，之后会重新提问
    #[serde(default)]
    pub rejections: Vec<FieldTarget>,
    #[serde(default)]
    pub declines: Vec<FieldTarget>,
    /// 放弃的任务（按名）
    #[serde(default)]
    pub abandon: Vec<String>,
    #[serde(default)]
    pub kb_records: Vec<KBQueryProposal>,
    #[serde(default)]
    pub kb_parameters: Vec<KBParameterAssignment>,
    /// 重试：任务名 / id 清空失败动作；知识库查询 id / 问题原文 / 知识库名清除查询错误
    #[serde(default)]
    pub retry: Vec<String>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn new_task(mut self, worksheet: &str) -> Self {
        self.new_tasks.push(TaskProposal {
            worksheet: worksheet.to_string(),
            values: BTreeMap::new(),
            initiator: Initiator::User,
        });
        self
    }

    /// 新建任务并带初始值
    pub fn new_task_with(mut self, worksheet: &str, values: impl IntoIterator<Item = (&'static str, Value)>) -> Self {
        self.new_tasks.push(TaskProposal {
            worksheet: worksheet.to_string(),
            values: values.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            initiator: Initiator::User,
        });
        self
    }

    pub fn assign(mut self, field: &str, value: Value) -> Self {
        self.assignments.push(FieldAssignment {
            task: None,
            field: field.to_string(),
            value,
        });
        self
    }

    pub fn assign_in(mut self, task: &str, field: &str, value: Value) -> Self {
        self.assignments.push(FieldAssignment {
            task: Some(task.to_string()),
            field: field.to_string(),
            value,
        });
        self
    }

    pub fn confirm(mut self, field: &str) -> Self {
        self.confirmations.push(FieldTarget {
            task: None,
            field: field.to_string(),
        });
        self
    }

    pub fn reject(mut self, field: &str) -> Self {
        self.rejections.push(FieldTarget {
            task: None,
            field: field.to_string(),
        });
        self
    }

    pub fn decline(mut self, field: &str) -> Self {
        self.declines.push(FieldTarget {
            task: None,
            field: field.to_string(),
        });
        self
    }

    pub fn accept(mut self, worksheet: &str) -> Self {
        self.accept_proposals.push(worksheet.to_string());
        self
    }

    pub fn abandon_task(mut self, worksheet: &str) -> Self {
        self.abandon.push(worksheet.to_string());
        self
    }

    pub fn kb_query(mut self, database: &str, question: &str, formal_query: &str) -> Self {
        self.kb_records.push(KBQueryProposal {
            database: database.to_string(),
            question: question.to_string(),
            formal_query: formal_query.to_string(),
            parameters: Vec::new(),
        });
        self
    }

    pub fn retry_task(mut self, worksheet: &str) -> Self {
        self.retry.push(worksheet.to_string());
        self
    }

    /// key 为查询 id、问题原文或知识库名
    pub fn retry_query(mut self, key: &str) -> Self {
        self.retry.push(key.to_string());
        self
    }
}
