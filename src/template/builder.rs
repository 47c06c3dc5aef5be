//! 工作表构建器
//!
//! 提供流畅的 API 构建 WorksheetTemplate；`build()` 解析谓词与动作并做本地校验，
//! 跨工作表引用在加载完整规格后由 loader 检查。

use std::collections::HashSet;

use crate::action::parse_statements;
use crate::core::SpecError;
use crate::predicate::{Expr, Predicate};
use crate::state::FieldValue;
use crate::template::{
    ActionSpec, FieldKind, FieldTemplate, FieldType, WorksheetKind, WorksheetTemplate,
};

/// 字段构建器
#[derive(Debug, Clone)]
pub struct FieldBuilder {
    name: String,
    kind: FieldKind,
    ty: FieldType,
    description: String,
    predicate: String,
    dont_ask: bool,
    required: bool,
    needs_confirmation: bool,
    default: Option<serde_json::Value>,
    primary_key: bool,
    actions: Vec<(Option<String>, String)>,
}

impl FieldBuilder {
    /// 新的必填输入字段
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Input,
            ty,
            description: String::new(),
            predicate: String::new(),
            dont_ask: false,
            required: true,
            needs_confirmation: false,
            default: None,
            primary_key: false,
            actions: Vec::new(),
        }
    }

    pub fn kind(mut self, kind: FieldKind) -> Self {
        self.kind = kind;
        self
    }

    /// 内部字段：不提问，由动作写入
    pub fn internal(self) -> Self {
        self.kind(FieldKind::Internal)
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn predicate(mut self, src: impl Into<String>) -> Self {
        self.predicate = src.into();
        self
    }

    pub fn dont_ask(mut self) -> Self {
        self.dont_ask = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// 赋值后需要用户确认
    pub fn confirm(mut self) -> Self {
        self.needs_confirmation = true;
        self
    }

    pub fn default_value(mut self, value: FieldValue) -> Self {
        self.default = Some(value.to_json());
        self
    }

    /// 未经校验的默认值（来自规格文件）
    pub fn default_json(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn action(mut self, src: impl Into<String>) -> Self {
        self.actions.push((None, src.into()));
        self
    }

    pub fn action_with_id(mut self, id: impl Into<String>, src: impl Into<String>) -> Self {
        self.actions.push((Some(id.into()), src.into()));
        self
    }

    fn build(self, worksheet: &str, action_ids: &mut HashSet<String>) -> Result<FieldTemplate, SpecError> {
        if self.name.trim().is_empty() {
            return Err(SpecError::EmptyFieldName(worksheet.to_string()));
        }
        if matches!(&self.ty, FieldType::Enum(values) if values.is_empty()) {
            return Err(SpecError::EmptyEnum {
                worksheet: worksheet.to_string(),
                field: self.name,
            });
        }
        let owner = format!("{worksheet}.{}", self.name);
        let predicate = Predicate::parse(&self.predicate).map_err(|reason| {
            SpecError::InvalidPredicate {
                owner: owner.clone(),
                reason,
            }
        })?;
        let default = match self.default {
            Some(json) => Some(FieldValue::from_json(&self.ty, &json).map_err(|e| {
                SpecError::InvalidDefault {
                    worksheet: worksheet.to_string(),
                    field: self.name.clone(),
                    reason: e.to_string(),
                }
            })?),
            None => None,
        };
        let actions = build_actions(&owner, worksheet, self.actions, action_ids)?;
        Ok(FieldTemplate {
            name: self.name,
            kind: self.kind,
            ty: self.ty,
            predicate,
            description: self.description,
            dont_ask: self.dont_ask,
            required: self.required,
            needs_confirmation: self.needs_confirmation,
            default,
            primary_key: self.primary_key,
            actions,
        })
    }
}

/// 工作表构建器
#[derive(Debug, Clone)]
pub struct WorksheetBuilder {
    name: String,
    kind: WorksheetKind,
    description: String,
    predicate: String,
    allow_concurrent: bool,
    fields: Vec<FieldBuilder>,
    actions: Vec<(Option<String>, String)>,
}

impl WorksheetBuilder {
    pub fn new(name: impl Into<String>, kind: WorksheetKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            predicate: String::new(),
            allow_concurrent: false,
            fields: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn task(name: impl Into<String>) -> Self {
        Self::new(name, WorksheetKind::Task)
    }

    pub fn knowledge_base(name: impl Into<String>) -> Self {
        Self::new(name, WorksheetKind::KnowledgeBase)
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn predicate(mut self, src: impl Into<String>) -> Self {
        self.predicate = src.into();
        self
    }

    pub fn allow_concurrent(mut self, allow: bool) -> Self {
        self.allow_concurrent = allow;
        self
    }

    pub fn field(mut self, field: FieldBuilder) -> Self {
        self.fields.push(field);
        self
    }

    /// 工作表动作，按添加顺序执行
    pub fn action(mut self, src: impl Into<String>) -> Self {
        self.actions.push((None, src.into()));
        self
    }

    pub fn action_with_id(mut self, id: impl Into<String>, src: impl Into<String>) -> Self {
        self.actions.push((Some(id.into()), src.into()));
        self
    }

    /// 解析并校验，生成只读模板
    pub fn build(self) -> Result<WorksheetTemplate, SpecError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(SpecError::EmptyName);
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.clone()) {
                return Err(SpecError::DuplicateField {
                    worksheet: name.clone(),
                    field: field.name.clone(),
                });
            }
        }
        let predicate = Predicate::parse(&self.predicate).map_err(|reason| {
            SpecError::InvalidPredicate {
                owner: name.clone(),
                reason,
            }
        })?;

        let mut action_ids = HashSet::new();
        let fields = self
            .fields
            .into_iter()
            .map(|f| f.build(&name, &mut action_ids))
            .collect::<Result<Vec<_>, _>>()?;
        let actions = build_actions(&name, &name, self.actions, &mut action_ids)?;

        let template = WorksheetTemplate {
            name,
            kind: self.kind,
            description: self.description,
            predicate,
            allow_concurrent: self.allow_concurrent,
            fields,
            actions,
        };
        check_local_references(&template)?;
        Ok(template)
    }
}

/// 解析动作源码并分配 id：`<owner>#<n>`
fn build_actions(
    owner: &str,
    worksheet: &str,
    sources: Vec<(Option<String>, String)>,
    action_ids: &mut HashSet<String>,
) -> Result<Vec<ActionSpec>, SpecError> {
    sources
        .into_iter()
        .enumerate()
        .map(|(n, (id, source))| {
            let statements = parse_statements(&source).map_err(|reason| SpecError::InvalidAction {
                owner: owner.to_string(),
                reason,
            })?;
            let id = id.unwrap_or_else(|| format!("{owner}#{n}"));
            if !action_ids.insert(id.clone()) {
                return Err(SpecError::DuplicateActionId {
                    worksheet: worksheet.to_string(),
                    id,
                });
            }
            Ok(ActionSpec {
                id,
                source,
                statements,
            })
        })
        .collect()
}

/// 未限定的字段引用与赋值目标必须是本工作表的字段
fn check_local_references(template: &WorksheetTemplate) -> Result<(), SpecError> {
    let check_expr = |owner: &str, expr: &Expr| -> Result<(), SpecError> {
        let mut refs = Vec::new();
        expr.references(&mut refs);
        match refs
            .into_iter()
            .find(|r| r.worksheet.is_none() && template.field(&r.field).is_none())
        {
            Some(r) => Err(SpecError::UnknownReference {
                owner: owner.to_string(),
                target: r.field.clone(),
            }),
            None => Ok(()),
        }
    };
    let check_action = |action: &ActionSpec| -> Result<(), SpecError> {
        for statement in &action.statements {
            if let Some(target) = statement.target_field() {
                if template.field(target).is_none() {
                    return Err(SpecError::UnknownReference {
                        owner: action.id.clone(),
                        target: target.to_string(),
                    });
                }
            }
            for expr in statement.expressions() {
                check_expr(&action.id, expr)?;
            }
        }
        Ok(())
    };

    check_expr(&template.name, template.predicate.expr())?;
    for field in &template.fields {
        check_expr(&format!("{}.{}", template.name, field.name), field.predicate.expr())?;
        field.actions.iter().try_for_each(&check_action)?;
    }
    template.actions.iter().try_for_each(&check_action)
}
