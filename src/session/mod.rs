//! 会话循环
//!
//! 一轮：解析话语 → 合并增量并运行策略 → 生成回复 → 持久化。
//! 同一会话的轮次必须串行；不同会话各自持有 DialogueState，只共享只读的模板注册表。

pub mod responder;
pub mod traits;

pub use responder::PlainResponder;
pub use traits::{JsonDeltaParser, ResponseGenerator, SemanticParser};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::WorksheetError;
use crate::policy::{AgentAct, PolicyEngine};
use crate::state::{DialogueState, StateDelta, StatePersistence};

/// 一轮对话记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub utterance: String,
    pub delta: StateDelta,
    pub acts: Vec<AgentAct>,
    pub response: String,
    pub at: DateTime<Utc>,
}

/// 一轮的产出
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutput {
    pub acts: Vec<AgentAct>,
    pub response: String,
}

pub struct Session {
    state: DialogueState,
    engine: Arc<PolicyEngine>,
    parser: Box<dyn SemanticParser>,
    responder: Box<dyn ResponseGenerator>,
    persistence: Option<StatePersistence>,
    history: Vec<DialogueTurn>,
}

impl Session {
    pub fn new(
        engine: Arc<PolicyEngine>,
        parser: Box<dyn SemanticParser>,
        responder: Box<dyn ResponseGenerator>,
    ) -> Self {
        Self {
            state: DialogueState::new(),
            engine,
            parser,
            responder,
            persistence: None,
            history: Vec::new(),
        }
    }

    /// 每轮成功后写入快照
    pub fn with_persistence(mut self, persistence: StatePersistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// 从快照恢复会话；快照不存在时从空状态开始
    pub fn resume(
        engine: Arc<PolicyEngine>,
        parser: Box<dyn SemanticParser>,
        responder: Box<dyn ResponseGenerator>,
        persistence: StatePersistence,
    ) -> Result<Self, WorksheetError> {
        let state = persistence
            .load()
            .map_err(|e| WorksheetError::Persistence(e.to_string()))?;
        info!(
            path = %persistence.path().display(),
            tasks = state.focus_stack.len(),
            "session resumed"
        );
        let mut session = Self::new(engine, parser, responder).with_persistence(persistence);
        session.state = state;
        Ok(session)
    }

    pub fn state(&self) -> &DialogueState {
        &self.state
    }

    pub fn history(&self) -> &[DialogueTurn] {
        &self.history
    }

    /// 处理一句用户话语；失败语义见 apply_delta
    pub async fn turn(&mut self, utterance: &str) -> Result<TurnOutput, WorksheetError> {
        let prior: &[AgentAct] = self.history.last().map(|t| t.acts.as_slice()).unwrap_or(&[]);
        let delta = self
            .parser
            .parse(utterance, &self.state, self.engine.registry(), prior)
            .await
            .map_err(WorksheetError::Parser)?;
        self.apply_delta(utterance, delta).await
    }

    /// 跳过解析，直接应用增量
    ///
    /// 解析或合并失败时状态与历史都不变。合并成功后这一轮已经生效：
    /// 回复生成或持久化失败仍返回错误，但状态已推进且本轮已记入历史（response 为空）。
    pub async fn apply_delta(
        &mut self,
        utterance: &str,
        delta: StateDelta,
    ) -> Result<TurnOutput, WorksheetError> {
        let acts = match self.engine.run_turn(&mut self.state, delta.clone()).await {
            Ok(acts) => acts,
            Err(e) => {
                warn!(error = %e, "delta rejected");
                return Err(e.into());
            }
        };
        // 策略已推进状态并可能调用过外部 API：先记入历史，回复与持久化失败不回滚
        self.history.push(DialogueTurn {
            utterance: utterance.to_string(),
            delta,
            acts: acts.clone(),
            response: String::new(),
            at: Utc::now(),
        });
        let response = self
            .responder
            .respond(&acts, &self.state)
            .await
            .map_err(WorksheetError::Responder)?;
        if let Some(turn) = self.history.last_mut() {
            turn.response = response.clone();
        }
        if let Some(persistence) = &self.persistence {
            persistence
                .save(&self.state)
                .map_err(|e| WorksheetError::Persistence(e.to_string()))?;
        }
        info!(turn = self.history.len(), acts = acts.len(), "turn completed");
        Ok(TurnOutput { acts, response })
    }
}
