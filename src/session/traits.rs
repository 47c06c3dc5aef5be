//! 会话外部接缝：语义解析器与回复生成器
//!
//! 引擎本身不做自然语言理解与生成；两端都通过 trait 注入，便于替换为真实的 NLU / NLG 后端。

use async_trait::async_trait;

use crate::policy::AgentAct;
use crate::state::{DialogueState, StateDelta};
use crate::template::TemplateRegistry;

/// 语义解析：用户话语 → 状态增量
#[async_trait]
pub trait SemanticParser: Send + Sync {
    /// prior_acts 为上一轮代理行为（解析「是的」「不要」等回答时需要）
    async fn parse(
        &self,
        utterance: &str,
        state: &DialogueState,
        registry: &TemplateRegistry,
        prior_acts: &[AgentAct],
    ) -> Result<StateDelta, String>;
}

/// 回复生成：本轮行为 → 文本
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn respond(&self, acts: &[AgentAct], state: &DialogueState) -> Result<String, String>;
}

/// 把话语直接当作 JSON 增量；空行为空增量
#[derive(Debug, Default, Clone)]
pub struct JsonDeltaParser;

#[async_trait]
impl SemanticParser for JsonDeltaParser {
    async fn parse(
        &self,
        utterance: &str,
        _state: &DialogueState,
        _registry: &TemplateRegistry,
        _prior_acts: &[AgentAct],
    ) -> Result<StateDelta, String> {
        let trimmed = utterance.trim();
        if trimmed.is_empty() {
            return Ok(StateDelta::new());
        }
        serde_json::from_str(trimmed).map_err(|e| format!("Invalid delta JSON: {e}"))
    }
}
