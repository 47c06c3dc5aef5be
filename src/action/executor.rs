//! 动作执行器
//!
//! 持有 ApiRegistry 与全局超时；每个动作在记录的草稿副本上逐条执行语句，
//! 全部成功才提交并记入 actions_executed，任一语句失败则整体丢弃。
//! 每次外部调用输出结构化审计日志（JSON）。

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::time::timeout;
use tracing::debug;

use crate::action::{ApiRegistry, CallArg, Statement};
use crate::core::ActionError;
use crate::policy::AgentAct;
use crate::predicate::{EvalContext, Expr, Literal};
use crate::state::{DialogueState, FieldValue, TaskRecord};
use crate::template::{ActionSpec, TemplateRegistry, WorksheetTemplate};

/// 动作提出的新工作表（策略在本轮扫描结束后统一压栈）
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub worksheet: String,
    pub values: BTreeMap<String, FieldValue>,
}

/// 一次成功执行的产出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutcome {
    pub acts: Vec<AgentAct>,
    pub proposals: Vec<Proposal>,
}

pub struct ActionExecutor {
    apis: ApiRegistry,
    timeout: Duration,
}

impl ActionExecutor {
    pub fn new(apis: ApiRegistry, timeout_secs: u64) -> Self {
        Self {
            apis,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn apis(&self) -> &ApiRegistry {
        &self.apis
    }

    /// 执行动作，返回更新后的记录与产出；已执行过的动作直接返回原记录
    pub async fn execute(
        &self,
        registry: &TemplateRegistry,
        state: &DialogueState,
        record: &TaskRecord,
        action: &ActionSpec,
    ) -> Result<(TaskRecord, ActionOutcome), ActionError> {
        if record.has_executed(&action.id) {
            return Ok((record.clone(), ActionOutcome::default()));
        }
        let template = registry
            .get(&record.template)
            .ok_or_else(|| ActionError::UnknownTemplate(record.template.clone()))?;

        let mut scratch = record.clone();
        let mut outcome = ActionOutcome::default();
        for statement in &action.statements {
            self.run_statement(registry, state, template, &mut scratch, statement, &mut outcome)
                .await?;
        }
        scratch.actions_executed.insert(action.id.clone());
        debug!(action = %action.id, task = %record.template, "action executed");
        Ok((scratch, outcome))
    }

    async fn run_statement(
        &self,
        registry: &TemplateRegistry,
        state: &DialogueState,
        template: &WorksheetTemplate,
        scratch: &mut TaskRecord,
        statement: &Statement,
        outcome: &mut ActionOutcome,
    ) -> Result<(), ActionError> {
        match statement {
            Statement::Say(expr) => {
                let text = render(registry, state, scratch, expr)?;
                outcome.acts.push(AgentAct::say(text));
            }
            Statement::Report(query, answer) => {
                let query = render(registry, state, scratch, query)?;
                let answer = render(registry, state, scratch, answer)?;
                outcome.acts.push(AgentAct::report(query, answer));
            }
            Statement::Assign { field, value } => {
                let value = evaluate(registry, state, scratch, value)?;
                store(template, scratch, field, value)?;
            }
            Statement::Call { target, api, args } => {
                let args = self.call_args(registry, state, scratch, args)?;
                let result = self.call_api(api, args).await?;
                if let Some(field) = target {
                    let result = match result {
                        Value::Object(mut map) if map.contains_key(field) => {
                            map.remove(field).unwrap_or(Value::Null)
                        }
                        other => other,
                    };
                    let ft = template.field(field).ok_or_else(|| ActionError::InvalidAssignment {
                        field: field.clone(),
                        reason: "unknown field".to_string(),
                    })?;
                    let value = FieldValue::from_json(&ft.ty, &result).map_err(|e| {
                        ActionError::InvalidAssignment {
                            field: field.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    scratch.assign(ft, value);
                }
            }
            Statement::Propose { worksheet, values } => {
                let mut evaluated = BTreeMap::new();
                for (name, expr) in values {
                    evaluated.insert(name.clone(), evaluate(registry, state, scratch, expr)?);
                }
                outcome.proposals.push(Proposal {
                    worksheet: worksheet.clone(),
                    values: evaluated,
                });
            }
        }
        Ok(())
    }

    fn call_args(
        &self,
        registry: &TemplateRegistry,
        state: &DialogueState,
        record: &TaskRecord,
        args: &[CallArg],
    ) -> Result<Map<String, Value>, ActionError> {
        let ctx = EvalContext::new(registry, state, Some(record));
        let mut map = Map::new();
        for arg in args {
            let value = ctx.value(&arg.value)?;
            map.insert(
                arg.name.clone(),
                value.map(|v| v.to_json()).unwrap_or(Value::Null),
            );
        }
        Ok(map)
    }

    /// 在超时内调用外部 API；输出 JSON 审计日志
    async fn call_api(&self, api_name: &str, args: Map<String, Value>) -> Result<Value, ActionError> {
        let api = self
            .apis
            .get(api_name)
            .ok_or_else(|| ActionError::UnknownApi(api_name.to_string()))?;
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, api.call(args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "action_audit",
            "api": api_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "external api");

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(ActionError::ApiFailed {
                api: api_name.to_string(),
                message,
            }),
            Err(_) => Err(ActionError::Timeout(api_name.to_string())),
        }
    }
}

/// 求值；引用的字段未赋值时报 Unresolved
fn evaluate(
    registry: &TemplateRegistry,
    state: &DialogueState,
    record: &TaskRecord,
    expr: &Expr,
) -> Result<FieldValue, ActionError> {
    let ctx = EvalContext::new(registry, state, Some(record));
    ctx.value(expr)?.ok_or_else(|| {
        let mut refs = Vec::new();
        expr.references(&mut refs);
        let names: Vec<String> = refs.iter().map(|r| r.to_string()).collect();
        ActionError::Unresolved(names.join(", "))
    })
}

/// 文本化；字符串字面量中的 `{field}` 用记录中的值替换
fn render(
    registry: &TemplateRegistry,
    state: &DialogueState,
    record: &TaskRecord,
    expr: &Expr,
) -> Result<String, ActionError> {
    if let Expr::Literal(Literal::Value(FieldValue::String(text))) = expr {
        return interpolate(text, record);
    }
    Ok(evaluate(registry, state, record, expr)?.to_string())
}

fn interpolate(text: &str, record: &TaskRecord) -> Result<String, ActionError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let name = &rest[start + 1..start + len];
        out.push_str(&rest[..start]);
        match record.value(name.trim()) {
            Some(v) => out.push_str(&v.to_string()),
            None => return Err(ActionError::Unresolved(name.trim().to_string())),
        }
        rest = &rest[start + len + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn store(
    template: &WorksheetTemplate,
    record: &mut TaskRecord,
    field: &str,
    value: FieldValue,
) -> Result<(), ActionError> {
    let ft = template.field(field).ok_or_else(|| ActionError::InvalidAssignment {
        field: field.to_string(),
        reason: "unknown field".to_string(),
    })?;
    let value = value.conform(&ft.ty).map_err(|e| ActionError::InvalidAssignment {
        field: field.to_string(),
        reason: e.to_string(),
    })?;
    record.assign(ft, value);
    Ok(())
}

fn args_preview(args: &Map<String, Value>) -> String {
    let s = Value::Object(args.clone()).to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
