//! 代理行为（AgentAct）与本轮行为队列
//!
//! 队列规则：完全相同的行为只保留一个；已有提问（AskField / 确认请求）时不再追加 AskField，
//! 保证每轮至多一个待回答的字段问题。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::FieldValue;

/// 策略产出的代理行为
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "act", rename_all = "snake_case")]
pub enum AgentAct {
    Report {
        query: String,
        answer: String,
    },
    AskForFieldConfirmation {
        task: String,
        field: String,
        value: FieldValue,
    },
    Say {
        utterance: String,
    },
    ProposeWorksheet {
        template: String,
        initial_values: BTreeMap<String, FieldValue>,
    },
    AskField {
        task: String,
        field: String,
        description: String,
    },
}

impl AgentAct {
    pub fn say(utterance: impl Into<String>) -> Self {
        Self::Say {
            utterance: utterance.into(),
        }
    }

    pub fn report(query: impl Into<String>, answer: impl Into<String>) -> Self {
        Self::Report {
            query: query.into(),
            answer: answer.into(),
        }
    }

    /// 需要用户回答的行为
    pub fn is_question(&self) -> bool {
        matches!(
            self,
            Self::AskField { .. } | Self::AskForFieldConfirmation { .. }
        )
    }
}

impl fmt::Display for AgentAct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Report { query, answer } => write!(f, "Report({query}, {answer})"),
            Self::AskForFieldConfirmation { task, field, value } => {
                write!(f, "AskForFieldConfirmation({task}, {field}, {value})")
            }
            Self::Say { utterance } => write!(f, "Say({utterance})"),
            Self::ProposeWorksheet {
                template,
                initial_values,
            } => {
                let values: Vec<String> = initial_values
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                write!(f, "ProposeWorksheet({template}, {{{}}})", values.join(", "))
            }
            Self::AskField {
                task,
                field,
                description,
            } => write!(f, "AskField({task}, {field}, {description})"),
        }
    }
}

/// 一轮内按产生顺序累积的行为
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentActs {
    acts: Vec<AgentAct>,
}

impl AgentActs {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加行为；被去重或提问规则拦下时返回 false
    pub fn push(&mut self, act: AgentAct) -> bool {
        if self.acts.contains(&act) {
            return false;
        }
        if matches!(act, AgentAct::AskField { .. }) && self.has_question() {
            return false;
        }
        self.acts.push(act);
        true
    }

    pub fn extend(&mut self, acts: impl IntoIterator<Item = AgentAct>) {
        for act in acts {
            self.push(act);
        }
    }

    pub fn has_question(&self) -> bool {
        self.acts.iter().any(AgentAct::is_question)
    }

    pub fn len(&self) -> usize {
        self.acts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentAct> {
        self.acts.iter()
    }

    pub fn into_vec(self) -> Vec<AgentAct> {
        self.acts
    }
}
