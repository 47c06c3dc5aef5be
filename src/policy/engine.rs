//! 策略引擎
//!
//! 每轮在合并增量后做不动点扫描，每一遍依次经过四个阶段：
//!
//! 1. ResolvingKB：参数齐全且未完成的知识库查询逐个执行并 Report；缺参数时提问并结束本轮
//! 2. AssigningFields：待确认字段发出 AskForFieldConfirmation
//! 3. ExecutingTasks：从栈顶向下，先执行字段动作，再对已解决的任务执行工作表动作并出栈
//! 4. RequestingFields：为当前任务找第一个可问的字段发出 AskField，之后结束本轮
//!
//! 一遍没有产生新行为也没有改变状态即到达不动点；动作提出的新工作表在扫描结束后统一压栈。

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::action::{ActionExecutor, Proposal};
use crate::config::AppConfig;
use crate::core::{KnowledgeError, MergeError, RecoveryEngine};
use crate::knowledge::{KBAnswer, KnowledgeBase};
use crate::policy::{AgentAct, AgentActs};
use crate::predicate::EvalContext;
use crate::state::{DialogueState, Initiator, StateDelta, TaskRecord, TaskStatus};
use crate::template::{ActionSpec, FieldTemplate, FieldType, TemplateRegistry, WorksheetTemplate};

/// 策略参数
#[derive(Debug, Clone)]
pub struct PolicySettings {
    /// 一轮没有任何行为时的兜底话语
    pub idle_utterance: String,
    /// Confirm 字段被确认为否、任务放弃时的话语
    pub abandon_utterance: String,
    pub kb_timeout: Duration,
    pub kb_max_rows: usize,
    /// 栈空时主动提议第一个谓词成立的任务工作表
    pub open_new_worksheet_if_possible: bool,
    /// 失败的动作在后续轮次自动重试
    pub retry_failed_actions: bool,
    /// 覆盖按状态规模计算的扫描遍数上限
    pub max_passes: Option<usize>,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            idle_utterance: "Is there anything else I can help you with?".to_string(),
            abandon_utterance: "Okay, I have cancelled that.".to_string(),
            kb_timeout: Duration::from_secs(10),
            kb_max_rows: 3,
            open_new_worksheet_if_possible: false,
            retry_failed_actions: false,
            max_passes: None,
        }
    }
}

impl From<&AppConfig> for PolicySettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            idle_utterance: cfg.engine.idle_utterance.clone(),
            abandon_utterance: cfg.engine.abandon_utterance.clone(),
            kb_timeout: Duration::from_secs(cfg.engine.kb_timeout_secs),
            kb_max_rows: cfg.knowledge.max_rows,
            open_new_worksheet_if_possible: cfg.engine.open_new_worksheet_if_possible,
            retry_failed_actions: cfg.engine.retry_failed_actions,
            max_passes: cfg.engine.max_passes,
        }
    }
}

pub struct PolicyEngine {
    registry: Arc<TemplateRegistry>,
    executor: ActionExecutor,
    knowledge: Option<Arc<dyn KnowledgeBase>>,
    recovery: RecoveryEngine,
    settings: PolicySettings,
}

impl PolicyEngine {
    pub fn new(registry: Arc<TemplateRegistry>, executor: ActionExecutor, settings: PolicySettings) -> Self {
        Self {
            registry,
            executor,
            knowledge: None,
            recovery: RecoveryEngine::new(),
            settings,
        }
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &PolicySettings {
        &self.settings
    }

    /// 合并增量并运行策略；合并失败时状态不变、不产生行为
    pub async fn run_turn(
        &self,
        state: &mut DialogueState,
        delta: StateDelta,
    ) -> Result<Vec<AgentAct>, MergeError> {
        state.merge_delta(&self.registry, delta)?;
        Ok(self.run_policy(state).await)
    }

    /// 在当前状态上扫描到不动点，返回本轮行为
    pub async fn run_policy(&self, state: &mut DialogueState) -> Vec<AgentAct> {
        let mut acts = AgentActs::new();
        let mut proposals = Vec::new();
        let mut failed = HashSet::new();
        let bound = self.pass_bound(state);

        for pass in 0..bound {
            let before = acts.len();
            let (mut progress, blocked) = self.resolve_knowledge(state, &mut acts).await;
            if blocked {
                break;
            }
            self.request_confirmations(state, &mut acts);
            progress |= self
                .execute_tasks(state, &mut acts, &mut proposals, &mut failed)
                .await;
            if self.request_field(state, &mut acts) {
                break;
            }
            if !progress && acts.len() == before {
                debug!(pass, "policy reached fixed point");
                break;
            }
            if pass + 1 == bound {
                warn!(bound, "policy pass bound reached");
            }
        }

        self.propose_new_worksheet(state, &acts, &mut proposals);
        self.apply_proposals(state, proposals, &mut acts);
        if acts.is_empty() {
            acts.push(AgentAct::say(self.settings.idle_utterance.clone()));
        }
        state.refresh_statuses();
        acts.into_vec()
    }

    fn pass_bound(&self, state: &DialogueState) -> usize {
        if let Some(max) = self.settings.max_passes {
            return max.max(1);
        }
        let work: usize = state
            .focus_stack
            .iter()
            .filter_map(|r| self.registry.get(&r.template))
            .map(|t| t.fields.len() + t.action_count())
            .sum();
        work + state.kb_records.len() + state.focus_stack.len() + 2
    }

    fn worksheet_active(&self, state: &DialogueState, record: &TaskRecord, template: &WorksheetTemplate) -> bool {
        EvalContext::new(&self.registry, state, Some(record))
            .check(&template.predicate, &template.name)
            .is_true()
    }

    fn field_active(&self, state: &DialogueState, record: &TaskRecord, field: &FieldTemplate) -> bool {
        let owner = format!("{}.{}", record.template, field.name);
        EvalContext::new(&self.registry, state, Some(record))
            .check(&field.predicate, &owner)
            .is_true()
    }

    /// 激活的必填字段都已填写或被拒答，且需确认的字段都已确认
    fn is_resolved(&self, state: &DialogueState, record: &TaskRecord, template: &WorksheetTemplate) -> bool {
        template.fields.iter().all(|field| {
            if !self.field_active(state, record, field) {
                return true;
            }
            let set = record.is_set(&field.name);
            if field.blocks_completion() && !set && !record.declined.contains(&field.name) {
                return false;
            }
            !(set && field.requires_confirmation() && !record.confirmed.contains(&field.name))
        })
    }

    /// ResolvingKB；返回 (是否有进展, 是否因缺参数提问而阻塞)
    async fn resolve_knowledge(&self, state: &mut DialogueState, acts: &mut AgentActs) -> (bool, bool) {
        let mut progress = false;
        for index in 0..state.kb_records.len() {
            let record = &state.kb_records[index];
            if record.is_finalized() {
                continue;
            }
            if let Some(param) = record.missing_parameter() {
                let description = if param.description.is_empty() {
                    record.question.clone()
                } else {
                    param.description.clone()
                };
                acts.push(AgentAct::AskField {
                    task: record.database.clone(),
                    field: param.name.clone(),
                    description,
                });
                return (progress, true);
            }
            let Some(query) = record.render_query() else {
                continue;
            };
            let database = record.database.clone();
            let question = record.question.clone();
            let result = self.run_query(&database, &query).await;

            let record = &mut state.kb_records[index];
            match result {
                Ok(mut answer) => {
                    answer.rows.truncate(self.settings.kb_max_rows);
                    acts.push(AgentAct::report(question, answer.answer.clone()));
                    record.result = Some(answer);
                }
                Err(e) => {
                    warn!(database = %database, query = %query, error = %e, "knowledge base query failed");
                    acts.push(self.recovery.handle_knowledge(&question, &e));
                    record.error = Some(e.to_string());
                }
            }
            progress = true;
        }
        (progress, false)
    }

    async fn run_query(&self, database: &str, query: &str) -> Result<KBAnswer, KnowledgeError> {
        let kb = self.knowledge.as_ref().ok_or(KnowledgeError::NotConfigured)?;
        let start = Instant::now();
        let result = timeout(self.settings.kb_timeout, kb.run(database, query)).await;
        let outcome = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "kb_audit",
            "database": database,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "query": query,
        });
        info!(audit = %audit.to_string(), "knowledge base");
        match result {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(msg)) => Err(KnowledgeError::QueryFailed(msg)),
            Err(_) => Err(KnowledgeError::Timeout),
        }
    }

    /// AssigningFields：已赋值、需确认但未确认的字段（内层任务优先），不论值的来源
    fn request_confirmations(&self, state: &DialogueState, acts: &mut AgentActs) {
        for record in state.focus_stack.iter().rev() {
            if !record.is_active() || record.is_proposed() {
                continue;
            }
            let Some(template) = self.registry.get(&record.template) else {
                continue;
            };
            if !self.worksheet_active(state, record, template) {
                continue;
            }
            for field in &template.fields {
                if !field.requires_confirmation() || record.confirmed.contains(&field.name) {
                    continue;
                }
                let Some(value) = record.value(&field.name) else {
                    continue;
                };
                if self.field_active(state, record, field) {
                    acts.push(AgentAct::AskForFieldConfirmation {
                        task: template.name.clone(),
                        field: field.name.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
    }

    /// ExecutingTasks：栈顶到栈底
    async fn execute_tasks(
        &self,
        state: &mut DialogueState,
        acts: &mut AgentActs,
        proposals: &mut Vec<Proposal>,
        failed: &mut HashSet<(String, String)>,
    ) -> bool {
        let mut progress = false;
        let ids: Vec<String> = state.focus_stack.iter().rev().map(|r| r.id.clone()).collect();
        for id in ids {
            let Some(record) = state.record(&id) else {
                continue;
            };
            if !record.is_active() || record.is_proposed() {
                continue;
            }
            let Some(template) = self.registry.get(&record.template) else {
                warn!(task = %record.template, "record refers to an unknown worksheet");
                continue;
            };
            if !self.worksheet_active(state, record, template) {
                continue;
            }

            for field in template.fields.iter().filter(|f| !f.actions.is_empty()) {
                let ready = state.record(&id).is_some_and(|r| {
                    r.is_set(&field.name)
                        && (!field.requires_confirmation() || r.confirmed.contains(&field.name))
                        && self.field_active(state, r, field)
                });
                if !ready {
                    continue;
                }
                for action in &field.actions {
                    progress |= self
                        .run_action(state, &id, action, acts, proposals, failed)
                        .await;
                }
            }

            if self.abandon_if_declined(state, &id, template, acts) {
                progress = true;
                continue;
            }

            let resolved = state
                .record(&id)
                .is_some_and(|r| self.is_resolved(state, r, template));
            if !resolved {
                continue;
            }
            let mut all_done = true;
            for action in &template.actions {
                progress |= self
                    .run_action(state, &id, action, acts, proposals, failed)
                    .await;
                if !state.record(&id).is_some_and(|r| r.has_executed(&action.id)) {
                    all_done = false;
                    break;
                }
            }
            if all_done {
                if let Some(mut finished) = state.remove_task(&id) {
                    finished.status = TaskStatus::Completed;
                    info!(task = %finished.template, id = %finished.id, "task completed");
                    progress = true;
                }
            }
        }
        progress
    }

    /// 执行单个动作（跳过已执行或已失败的）；返回是否尝试了执行
    async fn run_action(
        &self,
        state: &mut DialogueState,
        id: &str,
        action: &ActionSpec,
        acts: &mut AgentActs,
        proposals: &mut Vec<Proposal>,
        failed: &mut HashSet<(String, String)>,
    ) -> bool {
        let key = (id.to_string(), action.id.clone());
        let Some(record) = state.record(id) else {
            return false;
        };
        if record.has_executed(&action.id)
            || record.failed_actions.contains(&action.id)
            || failed.contains(&key)
        {
            return false;
        }
        let result = self
            .executor
            .execute(&self.registry, state, record, action)
            .await;
        let Some(slot) = state.focus_stack.iter_mut().find(|r| r.id == id) else {
            return false;
        };
        match result {
            Ok((updated, outcome)) => {
                *slot = updated;
                acts.extend(outcome.acts);
                proposals.extend(outcome.proposals);
            }
            Err(e) => {
                warn!(action = %action.id, error = %e, "action failed");
                if !self.settings.retry_failed_actions {
                    slot.failed_actions.insert(action.id.clone());
                }
                failed.insert(key);
                acts.push(self.recovery.handle_action(&action.id, &e));
            }
        }
        true
    }

    /// Confirm 字段被确认为「否」时放弃任务
    fn abandon_if_declined(
        &self,
        state: &mut DialogueState,
        id: &str,
        template: &WorksheetTemplate,
        acts: &mut AgentActs,
    ) -> bool {
        let declined = state.record(id).is_some_and(|r| {
            template.fields.iter().any(|f| {
                f.ty == FieldType::Confirm
                    && r.confirmed.contains(&f.name)
                    && r.value(&f.name).and_then(|v| v.as_bool()) == Some(false)
            })
        });
        if !declined {
            return false;
        }
        if let Some(mut record) = state.remove_task(id) {
            record.status = TaskStatus::Abandoned;
            info!(task = %record.template, id = %record.id, "task abandoned");
        }
        acts.push(AgentAct::say(self.settings.abandon_utterance.clone()));
        true
    }

    /// RequestingFields：当前任务的第一个可问字段；返回是否发出了 AskField
    fn request_field(&self, state: &DialogueState, acts: &mut AgentActs) -> bool {
        if acts.has_question() {
            return false;
        }
        let Some(record) = state.current_task() else {
            return false;
        };
        let Some(template) = self.registry.get(&record.template) else {
            return false;
        };
        if !self.worksheet_active(state, record, template) {
            return false;
        }
        for field in &template.fields {
            if !field.is_askable()
                || record.is_set(&field.name)
                || record.declined.contains(&field.name)
            {
                continue;
            }
            if self.field_active(state, record, field) {
                return acts.push(AgentAct::AskField {
                    task: template.name.clone(),
                    field: field.name.clone(),
                    description: field.ask_description(),
                });
            }
        }
        false
    }

    /// 栈上没有活动任务时提议第一个谓词成立的任务工作表
    fn propose_new_worksheet(&self, state: &DialogueState, acts: &AgentActs, proposals: &mut Vec<Proposal>) {
        if !self.settings.open_new_worksheet_if_possible
            || acts.has_question()
            || !proposals.is_empty()
            || state.focus_stack.iter().any(TaskRecord::is_active)
        {
            return;
        }
        let ctx = EvalContext::new(&self.registry, state, None);
        if let Some(template) = self
            .registry
            .tasks()
            .find(|t| ctx.check(&t.predicate, &t.name).is_true())
        {
            proposals.push(Proposal {
                worksheet: template.name.clone(),
                values: BTreeMap::new(),
            });
        }
    }

    /// 提议的工作表以 Proposed 状态压栈，并在本轮行为末尾追加 ProposeWorksheet
    fn apply_proposals(&self, state: &mut DialogueState, proposals: Vec<Proposal>, acts: &mut AgentActs) {
        for proposal in proposals {
            let template = match self.registry.get(&proposal.worksheet) {
                Some(t) if t.is_task() => t,
                _ => {
                    warn!(worksheet = %proposal.worksheet, "cannot propose unknown worksheet");
                    continue;
                }
            };
            let mut record = TaskRecord::new(template, Initiator::Agent);
            for (name, value) in proposal.values {
                let Some(field) = template.field(&name) else {
                    continue;
                };
                match value.conform(&field.ty) {
                    Ok(v) => record.assign(field, v),
                    Err(e) => warn!(worksheet = %template.name, field = %name, error = %e, "proposed value dropped"),
                }
            }
            let initial_values = record.values.clone();
            match state.push_task(&self.registry, record) {
                Ok(()) => {
                    acts.push(AgentAct::ProposeWorksheet {
                        template: template.name.clone(),
                        initial_values,
                    });
                }
                Err(e) => debug!(worksheet = %template.name, error = %e, "proposal skipped"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ApiRegistry;
    use crate::knowledge::StaticKnowledgeBase;
    use crate::state::FieldValue;
    use crate::template::{FieldBuilder, WorksheetBuilder};
    use serde_json::json;

    fn engine_with(templates: Vec<WorksheetTemplate>, settings: PolicySettings) -> PolicyEngine {
        let mut registry = TemplateRegistry::new();
        for t in templates {
            registry.register(t).unwrap();
        }
        let mut apis = ApiRegistry::with_builtins();
        apis.register_fn("fail", |_| Err("boom".to_string()));
        PolicyEngine::new(Arc::new(registry), ActionExecutor::new(apis, 5), settings)
    }

    fn ask(task: &str, field: &str) -> AgentAct {
        AgentAct::AskField {
            task: task.into(),
            field: field.into(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn test_idle_turn_says_idle_utterance() {
        let engine = engine_with(vec![], PolicySettings::default());
        let mut state = DialogueState::new();
        let acts = engine.run_policy(&mut state).await;
        assert_eq!(
            acts,
            vec![AgentAct::say("Is there anything else I can help you with?")]
        );
    }

    #[tokio::test]
    async fn test_field_predicate_gates_question() {
        let engine = engine_with(
            vec![WorksheetBuilder::task("Book")
                .field(FieldBuilder::new("people", FieldType::Int))
                .field(FieldBuilder::new("kids", FieldType::Int).predicate("people > 2"))
                .build()
                .unwrap()],
            PolicySettings::default(),
        );
        let mut state = DialogueState::new();
        let acts = engine
            .run_turn(&mut state, StateDelta::new().new_task("Book").assign("people", json!(2)))
            .await
            .unwrap();
        // kids 不激活、不阻塞完成
        assert_eq!(acts, vec![AgentAct::say("Is there anything else I can help you with?")]);
        assert!(state.focus_stack.is_empty());

        let acts = engine
            .run_turn(&mut state, StateDelta::new().new_task("Book").assign("people", json!(4)))
            .await
            .unwrap();
        assert_eq!(acts, vec![ask("Book", "kids")]);
    }

    #[tokio::test]
    async fn test_field_action_runs_once() {
        let engine = engine_with(
            vec![WorksheetBuilder::task("Course")
                .field(FieldBuilder::new("code", FieldType::String).action("say('Noted {code}')"))
                .field(FieldBuilder::new("grade", FieldType::String))
                .build()
                .unwrap()],
            PolicySettings::default(),
        );
        let mut state = DialogueState::new();
        let acts = engine
            .run_turn(&mut state, StateDelta::new().new_task_with("Course", [("code", json!("CS106B"))]))
            .await
            .unwrap();
        assert_eq!(acts, vec![AgentAct::say("Noted CS106B"), ask("Course", "grade")]);

        let acts = engine.run_policy(&mut state).await;
        assert_eq!(acts, vec![ask("Course", "grade")]);
    }

    #[tokio::test]
    async fn test_failed_action_is_reported_once() {
        let engine = engine_with(
            vec![WorksheetBuilder::task("Job")
                .field(FieldBuilder::new("x", FieldType::Int))
                .action("call fail()")
                .build()
                .unwrap()],
            PolicySettings::default(),
        );
        let mut state = DialogueState::new();
        let acts = engine
            .run_turn(&mut state, StateDelta::new().new_task_with("Job", [("x", json!(1))]))
            .await
            .unwrap();
        assert_eq!(acts, vec![AgentAct::report("fail", "failed: boom")]);
        let record = state.focus().unwrap();
        assert!(record.failed_actions.contains("Job#0"));
        assert_eq!(record.status, TaskStatus::InProgress);

        // 不自动重试
        let acts = engine.run_policy(&mut state).await;
        assert_eq!(acts, vec![AgentAct::say("Is there anything else I can help you with?")]);

        // 显式重试
        let acts = engine
            .run_turn(&mut state, StateDelta::new().retry_task("Job"))
            .await
            .unwrap();
        assert_eq!(acts, vec![AgentAct::report("fail", "failed: boom")]);
    }

    #[tokio::test]
    async fn test_confirm_false_abandons_task() {
        let engine = engine_with(
            vec![WorksheetBuilder::task("Order")
                .field(FieldBuilder::new("item", FieldType::String))
                .field(FieldBuilder::new("sure", FieldType::Confirm))
                .action("say('ordered')")
                .build()
                .unwrap()],
            PolicySettings::default(),
        );
        let mut state = DialogueState::new();
        let acts = engine
            .run_turn(&mut state, StateDelta::new().new_task_with("Order", [("item", json!("tea"))]))
            .await
            .unwrap();
        assert_eq!(acts, vec![ask("Order", "sure")]);

        let acts = engine
            .run_turn(&mut state, StateDelta::new().assign("sure", json!(false)))
            .await
            .unwrap();
        assert_eq!(
            acts,
            vec![AgentAct::AskForFieldConfirmation {
                task: "Order".into(),
                field: "sure".into(),
                value: FieldValue::Bool(false),
            }]
        );

        let acts = engine
            .run_turn(&mut state, StateDelta::new().confirm("sure"))
            .await
            .unwrap();
        assert_eq!(acts, vec![AgentAct::say("Okay, I have cancelled that.")]);
        assert!(state.focus_stack.is_empty());
    }

    #[tokio::test]
    async fn test_propose_statement_pushes_proposed_record() {
        let engine = engine_with(
            vec![
                WorksheetBuilder::task("Book")
                    .field(FieldBuilder::new("restaurant", FieldType::String))
                    .action("propose(Taxi, destination = restaurant)")
                    .build()
                    .unwrap(),
                WorksheetBuilder::task("Taxi")
                    .field(FieldBuilder::new("destination", FieldType::String))
                    .field(FieldBuilder::new("time", FieldType::String))
                    .build()
                    .unwrap(),
            ],
            PolicySettings::default(),
        );
        let mut state = DialogueState::new();
        let acts = engine
            .run_turn(
                &mut state,
                StateDelta::new().new_task_with("Book", [("restaurant", json!("Nice Place"))]),
            )
            .await
            .unwrap();
        let mut values = BTreeMap::new();
        values.insert("destination".to_string(), FieldValue::String("Nice Place".into()));
        assert_eq!(
            acts,
            vec![AgentAct::ProposeWorksheet {
                template: "Taxi".into(),
                initial_values: values,
            }]
        );
        let focus = state.focus().unwrap();
        assert_eq!(focus.status, TaskStatus::Proposed);
        assert_eq!(focus.initiator, Initiator::Agent);

        let acts = engine
            .run_turn(&mut state, StateDelta::new().accept("Taxi"))
            .await
            .unwrap();
        assert_eq!(acts, vec![ask("Taxi", "time")]);
    }

    #[tokio::test]
    async fn test_proposed_value_needing_confirmation_is_asked() {
        let engine = engine_with(
            vec![
                WorksheetBuilder::task("Book")
                    .field(FieldBuilder::new("restaurant", FieldType::String))
                    .action("propose(Taxi, destination = restaurant)")
                    .build()
                    .unwrap(),
                WorksheetBuilder::task("Taxi")
                    .field(FieldBuilder::new("destination", FieldType::String).confirm())
                    .field(FieldBuilder::new("time", FieldType::String))
                    .action("say('Taxi to {destination} at {time}')")
                    .build()
                    .unwrap(),
            ],
            PolicySettings::default(),
        );
        let mut state = DialogueState::new();
        engine
            .run_turn(
                &mut state,
                StateDelta::new().new_task_with("Book", [("restaurant", json!("Nice Place"))]),
            )
            .await
            .unwrap();
        assert!(state.focus().unwrap().pending_confirmation.contains("destination"));

        let acts = engine
            .run_turn(&mut state, StateDelta::new().accept("Taxi"))
            .await
            .unwrap();
        assert_eq!(
            acts,
            vec![AgentAct::AskForFieldConfirmation {
                task: "Taxi".into(),
                field: "destination".into(),
                value: FieldValue::String("Nice Place".into()),
            }]
        );
        assert_eq!(state.focus().unwrap().status, TaskStatus::AwaitingConfirmation);

        let acts = engine
            .run_turn(
                &mut state,
                StateDelta::new().assign("time", json!("8pm")).confirm("destination"),
            )
            .await
            .unwrap();
        assert_eq!(acts, vec![AgentAct::say("Taxi to Nice Place at 8pm")]);
        assert!(state.focus_stack.is_empty());
    }

    #[tokio::test]
    async fn test_open_new_worksheet_if_possible() {
        let settings = PolicySettings {
            open_new_worksheet_if_possible: true,
            ..PolicySettings::default()
        };
        let engine = engine_with(
            vec![
                WorksheetBuilder::task("Hidden")
                    .predicate("false")
                    .build()
                    .unwrap(),
                WorksheetBuilder::task("Greet")
                    .field(FieldBuilder::new("name", FieldType::String))
                    .build()
                    .unwrap(),
            ],
            settings,
        );
        let mut state = DialogueState::new();
        let acts = engine.run_policy(&mut state).await;
        assert_eq!(
            acts,
            vec![AgentAct::ProposeWorksheet {
                template: "Greet".into(),
                initial_values: BTreeMap::new(),
            }]
        );
        // 已有提议时不重复提议
        let acts = engine.run_policy(&mut state).await;
        assert_eq!(acts, vec![AgentAct::say("Is there anything else I can help you with?")]);
    }

    #[tokio::test]
    async fn test_kb_query_without_backend_reports_failure() {
        let engine = engine_with(
            vec![WorksheetBuilder::knowledge_base("Courses").build().unwrap()],
            PolicySettings::default(),
        );
        let mut state = DialogueState::new();
        let acts = engine
            .run_turn(&mut state, StateDelta::new().kb_query("Courses", "rating?", "rating"))
            .await
            .unwrap();
        assert_eq!(
            acts,
            vec![AgentAct::report("rating?", "I cannot look that up right now.")]
        );
        assert!(state.kb_records[0].error.is_some());
        // 不会隐式重跑
        let acts = engine.run_policy(&mut state).await;
        assert_eq!(acts.len(), 1);
        assert!(matches!(acts[0], AgentAct::Say { .. }));
    }

    #[tokio::test]
    async fn test_kb_missing_parameter_asks_and_blocks() {
        let mut kb = StaticKnowledgeBase::new();
        kb.insert(
            "rating of CS106B",
            KBAnswer {
                rows: vec![json!({"rating": 4.3}); 5],
                answer: "4.3 average".into(),
            },
        );
        let engine = engine_with(
            vec![WorksheetBuilder::knowledge_base("Courses").build().unwrap()],
            PolicySettings::default(),
        )
        .with_knowledge(Arc::new(kb));
        let mut state = DialogueState::new();
        let mut delta = StateDelta::new().kb_query("Courses", "rating of a course", "rating of {course}");
        delta.kb_records[0].parameters.push(crate::state::KBParameterSpec {
            name: "course".into(),
            description: "Which course?".into(),
            value: None,
        });
        let acts = engine.run_turn(&mut state, delta).await.unwrap();
        assert_eq!(
            acts,
            vec![AgentAct::AskField {
                task: "Courses".into(),
                field: "course".into(),
                description: "Which course?".into(),
            }]
        );

        let mut delta = StateDelta::new();
        delta.kb_parameters.push(crate::state::KBParameterAssignment {
            record: "rating of a course".into(),
            name: "course".into(),
            value: json!("CS106B"),
        });
        let acts = engine.run_turn(&mut state, delta).await.unwrap();
        assert_eq!(acts, vec![AgentAct::report("rating of a course", "4.3 average")]);
        assert_eq!(state.kb_records[0].result.as_ref().map(|r| r.rows.len()), Some(3));
    }

    /// 第一次查询失败，之后成功
    struct FlakyKnowledgeBase {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl KnowledgeBase for FlakyKnowledgeBase {
        async fn run(&self, _database: &str, _query: &str) -> Result<KBAnswer, String> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                Err("connection reset".into())
            } else {
                Ok(KBAnswer {
                    rows: vec![],
                    answer: "4.3 average".into(),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_kb_retry_reruns_failed_query() {
        let kb = Arc::new(FlakyKnowledgeBase {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let engine = engine_with(
            vec![WorksheetBuilder::knowledge_base("Courses").build().unwrap()],
            PolicySettings::default(),
        )
        .with_knowledge(kb.clone());
        let mut state = DialogueState::new();
        let acts = engine
            .run_turn(&mut state, StateDelta::new().kb_query("Courses", "rating?", "rating"))
            .await
            .unwrap();
        assert_eq!(
            acts,
            vec![AgentAct::report("rating?", "The lookup failed: connection reset")]
        );

        // 没有 retry 不会重跑
        engine.run_policy(&mut state).await;
        assert_eq!(kb.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let acts = engine
            .run_turn(&mut state, StateDelta::new().retry_query("rating?"))
            .await
            .unwrap();
        assert_eq!(acts, vec![AgentAct::report("rating?", "4.3 average")]);
        assert!(state.kb_records[0].error.is_none());
        assert_eq!(kb.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
