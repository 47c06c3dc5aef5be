//! 错误恢复引擎
//!
//! 把动作与知识库失败映射为用户可见的 AgentAct，策略扫描据此继续而不是中断本轮。

use crate::core::{ActionError, KnowledgeError};
use crate::policy::AgentAct;

/// 语义化错误恢复：失败 → Report / Say
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 动作失败；action_id 形如 `BookRestaurant#0`
    pub fn handle_action(&self, action_id: &str, err: &ActionError) -> AgentAct {
        match err {
            ActionError::Timeout(api) => AgentAct::say(format!(
                "Sorry, '{api}' did not respond in time. Please try again later."
            )),
            ActionError::ApiFailed { api, message } => {
                AgentAct::report(api.clone(), format!("failed: {message}"))
            }
            ActionError::UnknownApi(api) => {
                AgentAct::report(action_id, format!("failed: '{api}' is not available"))
            }
            other => AgentAct::report(action_id, format!("failed: {other}")),
        }
    }

    /// 知识库查询失败；question 为记录上的自然语言问题
    pub fn handle_knowledge(&self, question: &str, err: &KnowledgeError) -> AgentAct {
        match err {
            KnowledgeError::NotConfigured => {
                AgentAct::report(question, "I cannot look that up right now.")
            }
            KnowledgeError::Timeout => {
                AgentAct::report(question, "The lookup timed out, please ask again later.")
            }
            KnowledgeError::QueryFailed(msg) => {
                AgentAct::report(question, format!("The lookup failed: {msg}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_timeout_becomes_say() {
        let engine = RecoveryEngine::new();
        let act = engine.handle_action("Book#0", &ActionError::Timeout("book".into()));
        match act {
            AgentAct::Say { utterance } => assert!(utterance.contains("book")),
            _ => panic!("Expected Say"),
        }
    }

    #[test]
    fn test_recovery_api_failure_reports_api() {
        let engine = RecoveryEngine::new();
        let act = engine.handle_action(
            "Book#0",
            &ActionError::ApiFailed {
                api: "book".into(),
                message: "no tables".into(),
            },
        );
        assert_eq!(act, AgentAct::report("book", "failed: no tables"));
    }

    #[test]
    fn test_recovery_other_errors_report_action_id() {
        let engine = RecoveryEngine::new();
        let act = engine.handle_action("Book#1", &ActionError::Unresolved("date".into()));
        match act {
            AgentAct::Report { query, answer } => {
                assert_eq!(query, "Book#1");
                assert!(answer.contains("date"));
            }
            _ => panic!("Expected Report"),
        }
    }

    #[test]
    fn test_recovery_knowledge_failure() {
        let engine = RecoveryEngine::new();
        let act = engine.handle_knowledge(
            "rating of CS106B?",
            &KnowledgeError::QueryFailed("no rows".into()),
        );
        assert_eq!(
            act,
            AgentAct::report("rating of CS106B?", "The lookup failed: no rows")
        );
    }
}
