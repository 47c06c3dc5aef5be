//! 对话状态：焦点栈 + 知识库查询记录
//!
//! 增量合并在副本上进行，全部成功后才替换原状态；任一错误时状态保持合并前的样子。

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::MergeError;
use crate::state::delta::{FieldTarget, StateDelta};
use crate::state::record::{KBParameter, KBQueryRecord, TaskRecord, TaskStatus};
use crate::state::FieldValue;
use crate::template::{TemplateRegistry, WorksheetKind, WorksheetTemplate};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DialogueState {
    /// 栈顶为当前焦点
    #[serde(default)]
    pub focus_stack: Vec<TaskRecord>,
    /// 按创建顺序
    #[serde(default)]
    pub kb_records: Vec<KBQueryRecord>,
}

impl DialogueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 栈顶记录
    pub fn focus(&self) -> Option<&TaskRecord> {
        self.focus_stack.last()
    }

    /// 默认的赋值目标：最上面一条已接受的活动任务
    pub fn current_task(&self) -> Option<&TaskRecord> {
        self.focus_stack
            .iter()
            .rev()
            .find(|r| r.is_active() && !r.is_proposed())
    }

    /// 某模板最上面的活动实例
    pub fn find_active(&self, template: &str) -> Option<&TaskRecord> {
        self.focus_stack
            .iter()
            .rev()
            .find(|r| r.is_active() && r.template == template)
    }

    pub fn record(&self, id: &str) -> Option<&TaskRecord> {
        self.focus_stack.iter().find(|r| r.id == id)
    }

    /// 压栈；不允许并发的模板已有活动实例时拒绝
    pub fn push_task(
        &mut self,
        registry: &TemplateRegistry,
        record: TaskRecord,
    ) -> Result<(), MergeError> {
        let template = registry.resolve(&record.template)?;
        if !template.allow_concurrent && self.find_active(&template.name).is_some() {
            return Err(MergeError::DuplicateActiveTask(template.name.clone()));
        }
        debug!(task = %record.template, id = %record.id, "push task");
        self.focus_stack.push(record);
        Ok(())
    }

    /// 出栈，被弹出的任务之下的记录重新成为焦点
    pub fn pop_task(&mut self) -> Option<TaskRecord> {
        let record = self.focus_stack.pop();
        if let Some(r) = &record {
            debug!(task = %r.template, id = %r.id, "pop task");
        }
        record
    }

    /// 按 id 移出（完成或放弃的非栈顶记录）
    pub fn remove_task(&mut self, id: &str) -> Option<TaskRecord> {
        let index = self.focus_stack.iter().position(|r| r.id == id)?;
        if index + 1 == self.focus_stack.len() {
            return self.pop_task();
        }
        Some(self.focus_stack.remove(index))
    }

    pub fn refresh_statuses(&mut self) {
        self.focus_stack.iter_mut().for_each(TaskRecord::refresh_status);
    }

    /// 任务定位：None 为当前任务，否则先按 id 再按模板名
    fn task_index(&self, task: Option<&str>) -> Result<usize, MergeError> {
        let found = match task {
            None => self
                .focus_stack
                .iter()
                .rposition(|r| r.is_active() && !r.is_proposed()),
            Some(key) => self
                .focus_stack
                .iter()
                .position(|r| r.id == key && r.is_active())
                .or_else(|| {
                    self.focus_stack
                        .iter()
                        .rposition(|r| r.template == key && r.is_active())
                }),
        };
        found.ok_or_else(|| match task {
            None => MergeError::NoFocusTask,
            Some(key) => MergeError::TaskNotActive(key.to_string()),
        })
    }

    fn kb_index(&self, key: &str) -> Result<usize, MergeError> {
        self.kb_records
            .iter()
            .position(|r| r.id == key)
            .or_else(|| self.kb_records.iter().rposition(|r| r.question == key))
            .ok_or_else(|| MergeError::UnknownKbRecord(key.to_string()))
    }

    /// 全有或全无地合并增量
    pub fn merge_delta(
        &mut self,
        registry: &TemplateRegistry,
        delta: StateDelta,
    ) -> Result<(), MergeError> {
        let mut next = self.clone();
        next.apply(registry, delta)?;
        next.refresh_statuses();
        *self = next;
        Ok(())
    }

    fn apply(&mut self, registry: &TemplateRegistry, delta: StateDelta) -> Result<(), MergeError> {
        for proposal in delta.new_tasks {
            let template = registry.resolve(&proposal.worksheet)?;
            if !template.is_task() {
                return Err(MergeError::NotATask(template.name.clone()));
            }
            let mut record = TaskRecord::new(template, proposal.initiator);
            for (field, value) in &proposal.values {
                assign_json(&mut record, template, field, value)?;
            }
            info!(task = %template.name, id = %record.id, "new task");
            self.push_task(registry, record)?;
        }

        for name in delta.accept_proposals {
            let record = self
                .focus_stack
                .iter_mut()
                .rev()
                .find(|r| r.template == name && r.is_proposed())
                .ok_or_else(|| MergeError::TaskNotActive(name.clone()))?;
            record.status = TaskStatus::InProgress;
        }
        for name in delta.reject_proposals {
            let id = self
                .focus_stack
                .iter()
                .rev()
                .find(|r| r.template == name && r.is_proposed())
                .map(|r| r.id.clone())
                .ok_or_else(|| MergeError::TaskNotActive(name.clone()))?;
            self.remove_task(&id);
        }

        for assignment in delta.assignments {
            let index = self.task_index(assignment.task.as_deref())?;
            let record = &mut self.focus_stack[index];
            let template = registry.resolve(&record.template)?;
            assign_json(record, template, &assignment.field, &assignment.value)?;
        }

        for target in delta.confirmations {
            let record = self.target_record(registry, &target)?;
            if !record.confirm(&target.field) {
                debug!(field = %target.field, "confirmation for a field without a value");
            }
        }
        for target in delta.rejections {
            self.target_record(registry, &target)?.clear(&target.field);
        }
        for target in delta.declines {
            self.target_record(registry, &target)?.decline(&target.field);
        }

        for name in delta.abandon {
            let index = self.task_index(Some(&name))?;
            let mut record = self.focus_stack.remove(index);
            record.status = TaskStatus::Abandoned;
            info!(task = %record.template, id = %record.id, "task abandoned by user");
        }

        for query in delta.kb_records {
            let template = registry.resolve(&query.database)?;
            if template.kind != WorksheetKind::KnowledgeBase {
                return Err(MergeError::NotAKnowledgeBase(template.name.clone()));
            }
            let mut record = KBQueryRecord::new(&template.name, &query.question, &query.formal_query);
            record.parameters = query
                .parameters
                .into_iter()
                .map(|p| KBParameter {
                    name: p.name,
                    description: p.description,
                    value: p.value.as_ref().and_then(FieldValue::infer),
                })
                .collect();
            self.kb_records.push(record);
        }

        for assignment in delta.kb_parameters {
            let index = self.kb_index(&assignment.record)?;
            let record = &mut self.kb_records[index];
            if record.is_finalized() {
                return Err(MergeError::KbRecordFinalized(record.question.clone()));
            }
            let question = record.question.clone();
            let param = record.parameter_mut(&assignment.name).ok_or_else(|| {
                MergeError::UnknownKbParameter {
                    record: question,
                    name: assignment.name.clone(),
                }
            })?;
            param.value = FieldValue::infer(&assignment.value);
        }

        for key in delta.retry {
            self.retry(&key)?;
        }
        Ok(())
    }

    /// 任务（id / 模板名）清空失败动作；知识库查询（id / 问题原文 / 知识库名）清除错误后重跑
    fn retry(&mut self, key: &str) -> Result<(), MergeError> {
        if let Ok(index) = self.task_index(Some(key)) {
            self.focus_stack[index].failed_actions.clear();
            return Ok(());
        }
        let indices: Vec<usize> = match self.kb_index(key) {
            Ok(index) => vec![index],
            Err(_) => self
                .kb_records
                .iter()
                .enumerate()
                .filter(|(_, r)| r.database == key)
                .map(|(i, _)| i)
                .collect(),
        };
        if indices.is_empty() {
            return Err(MergeError::TaskNotActive(key.to_string()));
        }
        for index in indices {
            let record = &mut self.kb_records[index];
            if record.error.take().is_some() {
                debug!(question = %record.question, "knowledge base query will be retried");
            }
        }
        Ok(())
    }

    fn target_record(
        &mut self,
        registry: &TemplateRegistry,
        target: &FieldTarget,
    ) -> Result<&mut TaskRecord, MergeError> {
        let index = self.task_index(target.task.as_deref())?;
        let record = &mut self.focus_stack[index];
        let template = registry.resolve(&record.template)?;
        if template.field(&target.field).is_none() {
            return Err(MergeError::UnknownField {
                task: template.name.clone(),
                field: target.field.clone(),
            });
        }
        Ok(record)
    }
}

/// 校验并写入一个 JSON 值；null 清空字段
fn assign_json(
    record: &mut TaskRecord,
    template: &WorksheetTemplate,
    field: &str,
    value: &serde_json::Value,
) -> Result<(), MergeError> {
    let ft = template.field(field).ok_or_else(|| MergeError::UnknownField {
        task: template.name.clone(),
        field: field.to_string(),
    })?;
    if value.is_null() {
        record.clear(field);
        return Ok(());
    }
    let typed = FieldValue::from_json(&ft.ty, value)
        .map_err(|e| MergeError::from_value(&template.name, field, e))?;
    record.assign(ft, typed);
    Ok(())
}
