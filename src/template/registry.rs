//! 模板注册表
//!
//! 按声明顺序保存 WorksheetTemplate，运行期只读；可包在 Arc 中由多个会话共享。

use std::collections::HashMap;

use crate::core::RegistryError;
use crate::template::WorksheetTemplate;

#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: Vec<WorksheetTemplate>,
    index: HashMap<String, usize>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册模板；同名模板已存在时报错
    pub fn register(&mut self, template: WorksheetTemplate) -> Result<(), RegistryError> {
        if self.index.contains_key(&template.name) {
            return Err(RegistryError::DuplicateTemplate(template.name));
        }
        self.index.insert(template.name.clone(), self.templates.len());
        self.templates.push(template);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&WorksheetTemplate> {
        self.index.get(name).map(|&i| &self.templates[i])
    }

    pub fn resolve(&self, name: &str) -> Result<&WorksheetTemplate, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::UnknownTemplate(name.to_string()))
    }

    /// 按声明顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &WorksheetTemplate> {
        self.templates.iter()
    }

    /// 任务型模板（按声明顺序）
    pub fn tasks(&self) -> impl Iterator<Item = &WorksheetTemplate> {
        self.templates.iter().filter(|t| t.is_task())
    }

    pub fn names(&self) -> Vec<&str> {
        self.templates.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
