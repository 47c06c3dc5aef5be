//! 工作表规格加载器
//!
//! 支持 TOML（`[[worksheet]]` + `[[worksheet.field]]`）与 JSON（数组或 `{"worksheet": [...]}`）。
//! JSON 同时接受表格导出时的列名（ws_name / field_name / field_type ...）。
//! 每个模板在注册前经 WorksheetBuilder 校验，全部注册后再检查跨工作表引用。

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::action::Statement;
use crate::core::SpecError;
use crate::template::{
    FieldBuilder, FieldKind, FieldType, TemplateRegistry, WorksheetBuilder, WorksheetKind,
    WorksheetTemplate,
};

/// 规格文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecFormat {
    Toml,
    Json,
}

impl SpecFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => SpecFormat::Json,
            _ => SpecFormat::Toml,
        }
    }
}

/// 布尔列：表格导出中常见 "TRUE" / "yes" 字符串
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

impl Flag {
    fn is_set(&self) -> bool {
        match self {
            Flag::Bool(b) => *b,
            Flag::Text(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        }
    }
}

fn flag(f: &Option<Flag>, default: bool) -> bool {
    f.as_ref().map(Flag::is_set).unwrap_or(default)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAction {
    Source(String),
    Named { id: Option<String>, code: String },
}

/// 单个字符串（可含多条语句）或动作列表
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawActions {
    One(String),
    Many(Vec<RawAction>),
}

impl Default for RawActions {
    fn default() -> Self {
        RawActions::Many(Vec::new())
    }
}

impl RawActions {
    fn into_sources(self) -> Vec<(Option<String>, String)> {
        match self {
            RawActions::One(code) if code.trim().is_empty() => Vec::new(),
            RawActions::One(code) => vec![(None, code)],
            RawActions::Many(items) => items
                .into_iter()
                .map(|a| match a {
                    RawAction::Source(code) => (None, code),
                    RawAction::Named { id, code } => (id, code),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEnumValue {
    Plain(String),
    Described { value: String },
}

#[derive(Debug, Deserialize)]
struct RawField {
    #[serde(alias = "field_name")]
    name: String,
    #[serde(default, alias = "field_kind")]
    kind: String,
    #[serde(default, rename = "type", alias = "field_type")]
    ty: String,
    #[serde(default, alias = "enum_values")]
    values: Vec<RawEnumValue>,
    #[serde(default, alias = "field_description")]
    description: String,
    #[serde(default, alias = "field_predicate")]
    predicate: String,
    #[serde(default, alias = "field_dont_ask")]
    dont_ask: Option<Flag>,
    #[serde(default, alias = "field_required")]
    required: Option<Flag>,
    #[serde(default, alias = "field_confirm")]
    confirm: Option<Flag>,
    #[serde(default)]
    default: Option<serde_json::Value>,
    #[serde(default)]
    primary_key: Option<Flag>,
    #[serde(default, alias = "field_actions")]
    actions: RawActions,
}

#[derive(Debug, Deserialize)]
struct RawWorksheet {
    #[serde(alias = "ws_name")]
    name: String,
    #[serde(default, alias = "ws_kind", alias = "ws_type")]
    kind: String,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "ws_predicate")]
    predicate: String,
    #[serde(default)]
    allow_concurrent: Option<Flag>,
    #[serde(default, alias = "ws_actions")]
    actions: RawActions,
    #[serde(default, rename = "field", alias = "fields")]
    fields: Vec<RawField>,
}

#[derive(Debug, Deserialize)]
struct RawSpec {
    #[serde(default, rename = "worksheet", alias = "worksheets")]
    worksheets: Vec<RawWorksheet>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDocument {
    List(Vec<RawWorksheet>),
    Table(RawSpec),
}

impl RawField {
    fn into_builder(self, worksheet: &str) -> Result<FieldBuilder, SpecError> {
        let values: Vec<String> = self
            .values
            .into_iter()
            .map(|v| match v {
                RawEnumValue::Plain(s) | RawEnumValue::Described { value: s } => s,
            })
            .collect();
        let ty = if self.ty.trim().is_empty() && !values.is_empty() {
            FieldType::Enum(values)
        } else {
            FieldType::parse(&self.ty, &values).ok_or_else(|| SpecError::UnknownFieldType {
                worksheet: worksheet.to_string(),
                field: self.name.clone(),
                ty: self.ty.clone(),
            })?
        };
        let kind = FieldKind::parse(&self.kind).ok_or_else(|| SpecError::UnknownFieldKind {
            worksheet: worksheet.to_string(),
            field: self.name.clone(),
            kind: self.kind.clone(),
        })?;

        let mut builder = FieldBuilder::new(self.name, ty)
            .kind(kind)
            .description(self.description)
            .predicate(self.predicate)
            .required(flag(&self.required, true));
        if flag(&self.dont_ask, false) {
            builder = builder.dont_ask();
        }
        if flag(&self.confirm, false) {
            builder = builder.confirm();
        }
        if flag(&self.primary_key, false) {
            builder = builder.primary_key();
        }
        if let Some(default) = self.default {
            builder = builder.default_json(default);
        }
        for (id, code) in self.actions.into_sources() {
            builder = match id {
                Some(id) => builder.action_with_id(id, code),
                None => builder.action(code),
            };
        }
        Ok(builder)
    }
}

impl RawWorksheet {
    fn build(self) -> Result<WorksheetTemplate, SpecError> {
        let kind = WorksheetKind::parse(&self.kind).ok_or_else(|| SpecError::UnknownKind {
            worksheet: self.name.clone(),
            kind: self.kind.clone(),
        })?;
        let mut builder = WorksheetBuilder::new(self.name.clone(), kind)
            .description(self.description)
            .predicate(self.predicate)
            .allow_concurrent(flag(&self.allow_concurrent, false));
        for field in self.fields {
            builder = builder.field(field.into_builder(&self.name)?);
        }
        for (id, code) in self.actions.into_sources() {
            builder = match id {
                Some(id) => builder.action_with_id(id, code),
                None => builder.action(code),
            };
        }
        builder.build()
    }
}

/// 解析规格文本为模板列表（未注册）
pub fn parse_spec_str(content: &str, format: SpecFormat) -> Result<Vec<WorksheetTemplate>, SpecError> {
    let raw = match format {
        SpecFormat::Toml => toml::from_str::<RawSpec>(content)
            .map_err(|e| SpecError::Parse(e.to_string()))?
            .worksheets,
        SpecFormat::Json => match serde_json::from_str::<RawDocument>(content)
            .map_err(|e| SpecError::Parse(e.to_string()))?
        {
            RawDocument::List(list) => list,
            RawDocument::Table(spec) => spec.worksheets,
        },
    };
    raw.into_iter().map(RawWorksheet::build).collect()
}

/// 注册全部模板并检查跨工作表引用
pub fn registry_from_templates(
    templates: Vec<WorksheetTemplate>,
) -> Result<TemplateRegistry, SpecError> {
    let mut registry = TemplateRegistry::new();
    for template in templates {
        registry.register(template)?;
    }
    validate_references(&registry)?;
    Ok(registry)
}

/// 解析规格文本并构建注册表
pub fn load_spec_str(content: &str, format: SpecFormat) -> Result<TemplateRegistry, SpecError> {
    registry_from_templates(parse_spec_str(content, format)?)
}

/// 从文件加载规格
pub fn load_spec_file(path: &Path) -> Result<TemplateRegistry, SpecError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SpecError::Io(format!("{}: {e}", path.display())))?;
    let registry = load_spec_str(&content, SpecFormat::from_path(path))?;
    info!(
        path = %path.display(),
        worksheets = registry.len(),
        "worksheet spec loaded"
    );
    Ok(registry)
}

/// `Worksheet.field` 引用与 propose 目标必须存在
fn validate_references(registry: &TemplateRegistry) -> Result<(), SpecError> {
    let unknown = |owner: &str, target: String| SpecError::UnknownReference {
        owner: owner.to_string(),
        target,
    };
    for template in registry.iter() {
        let mut exprs = vec![(template.name.clone(), template.predicate.expr())];
        for field in &template.fields {
            exprs.push((format!("{}.{}", template.name, field.name), field.predicate.expr()));
        }
        let actions = template
            .actions
            .iter()
            .chain(template.fields.iter().flat_map(|f| f.actions.iter()));
        for action in actions {
            for statement in &action.statements {
                if let Statement::Propose { worksheet, values } = statement {
                    let target = registry
                        .get(worksheet)
                        .filter(|t| t.is_task())
                        .ok_or_else(|| unknown(&action.id, worksheet.clone()))?;
                    if let Some((name, _)) = values.iter().find(|(name, _)| target.field(name).is_none()) {
                        return Err(unknown(&action.id, format!("{worksheet}.{name}")));
                    }
                }
                for expr in statement.expressions() {
                    exprs.push((action.id.clone(), expr));
                }
            }
        }

        for (owner, expr) in exprs {
            let mut refs = Vec::new();
            expr.references(&mut refs);
            for r in refs {
                if let Some(ws) = &r.worksheet {
                    let known = registry
                        .get(ws)
                        .is_some_and(|t| t.field(&r.field).is_some());
                    if !known {
                        return Err(unknown(&owner, r.to_string()));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOML_SPEC: &str = r#"
[[worksheet]]
name = "BookRestaurant"
description = "Book a table"
actions = ["status = call echo(text = 'booked')", "report('booking', status)"]

[[worksheet.field]]
name = "restaurant"
type = "str"
description = "Which restaurant?"

[[worksheet.field]]
name = "cuisine"
type = "enum"
values = ["Italian", "Thai"]
required = false

[[worksheet.field]]
name = "status"
kind = "internal"
type = "str"
required = false

[[worksheet]]
name = "Courses"
kind = "kb"

[[worksheet.field]]
name = "code"
type = "str"
primary_key = true
"#;

    #[test]
    fn test_load_toml_spec() {
        let registry = load_spec_str(TOML_SPEC, SpecFormat::Toml).unwrap();
        assert_eq!(registry.names(), vec!["BookRestaurant", "Courses"]);
        let book = registry.get("BookRestaurant").unwrap();
        assert_eq!(book.actions.len(), 2);
        assert_eq!(book.fields[1].ty.enum_values().map(|v| v.len()), Some(2));
        assert!(!book.fields[1].required);
        assert_eq!(book.fields[2].kind, FieldKind::Internal);
        let courses = registry.get("Courses").unwrap();
        assert_eq!(courses.kind, WorksheetKind::KnowledgeBase);
        assert!(courses.fields[0].primary_key);
    }

    #[test]
    fn test_load_json_with_spreadsheet_columns() {
        let json = r#"[
            {
                "ws_name": "Course",
                "ws_predicate": "",
                "ws_actions": "say('Saved {title}')",
                "fields": [
                    {"field_name": "title", "field_type": "str", "field_confirm": "TRUE",
                     "field_description": "Course title"},
                    {"field_name": "grade", "field_type": "enum", "enum_values": ["A", "B"],
                     "field_required": "FALSE"}
                ]
            }
        ]"#;
        let registry = load_spec_str(json, SpecFormat::Json).unwrap();
        let course = registry.get("Course").unwrap();
        assert!(course.fields[0].needs_confirmation);
        assert!(!course.fields[1].required);
        assert_eq!(course.actions[0].id, "Course#0");
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let spec = r#"
[[worksheet]]
name = "W"
[[worksheet.field]]
name = "when"
type = "datetime"
"#;
        assert!(matches!(
            load_spec_str(spec, SpecFormat::Toml),
            Err(SpecError::UnknownFieldType { .. })
        ));
    }

    #[test]
    fn test_unknown_cross_reference_is_fatal() {
        let spec = r#"
[[worksheet]]
name = "W"
predicate = "Missing.field == 1"
"#;
        assert!(matches!(
            load_spec_str(spec, SpecFormat::Toml),
            Err(SpecError::UnknownReference { .. })
        ));
    }

    #[test]
    fn test_propose_target_must_exist() {
        let spec = r#"
[[worksheet]]
name = "W"
actions = ["propose(Taxi, destination = 'home')"]
"#;
        assert!(matches!(
            load_spec_str(spec, SpecFormat::Toml),
            Err(SpecError::UnknownReference { .. })
        ));
    }

    #[test]
    fn test_duplicate_worksheet_is_fatal() {
        let spec = r#"
[[worksheet]]
name = "W"
[[worksheet]]
name = "W"
"#;
        assert!(matches!(
            load_spec_str(spec, SpecFormat::Toml),
            Err(SpecError::Registry(_))
        ));
    }

    #[test]
    fn test_load_spec_file_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_spec_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, SpecError::Io(_)));
    }
}
