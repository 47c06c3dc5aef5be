//! 静态知识库：从 TOML / JSON 文件加载「查询 → 回答」表
//!
//! ```toml
//! [[entry]]
//! database = "Courses"
//! query = "rating of CS106B"
//! answer = "4.3 average"
//! rows = [{ course = "CS106B", rating = 4.3 }]
//! ```

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::knowledge::{KBAnswer, KnowledgeBase};

#[derive(Debug, Deserialize)]
struct KnowledgeFile {
    #[serde(default, rename = "entry")]
    entries: Vec<KnowledgeEntry>,
}

#[derive(Debug, Deserialize)]
struct KnowledgeEntry {
    /// 为空时对所有知识库生效
    #[serde(default)]
    database: Option<String>,
    query: String,
    answer: String,
    #[serde(default)]
    rows: Vec<serde_json::Value>,
}

/// 查询文本归一化（去首尾空白、折叠空格、小写）
fn normalize(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Default, Clone)]
pub struct StaticKnowledgeBase {
    entries: HashMap<(Option<String>, String), KBAnswer>,
}

impl StaticKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加一条适用于所有知识库的回答
    pub fn insert(&mut self, query: &str, answer: KBAnswer) {
        self.entries.insert((None, normalize(query)), answer);
    }

    pub fn insert_for(&mut self, database: &str, query: &str, answer: KBAnswer) {
        self.entries
            .insert((Some(database.to_string()), normalize(query)), answer);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 从文件加载；按扩展名选择 JSON 或 TOML
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: KnowledgeFile = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };
        let mut kb = Self::new();
        for entry in file.entries {
            let answer = KBAnswer {
                rows: entry.rows,
                answer: entry.answer,
            };
            match entry.database {
                Some(db) => kb.insert_for(&db, &entry.query, answer),
                None => kb.insert(&entry.query, answer),
            }
        }
        debug!(path = %path.display(), entries = kb.len(), "knowledge base loaded");
        Ok(kb)
    }
}

#[async_trait]
impl KnowledgeBase for StaticKnowledgeBase {
    async fn run(&self, database: &str, query: &str) -> Result<KBAnswer, String> {
        let key = normalize(query);
        self.entries
            .get(&(Some(database.to_string()), key.clone()))
            .or_else(|| self.entries.get(&(None, key)))
            .cloned()
            .ok_or_else(|| format!("no answer for '{query}' in {database}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_is_normalized() {
        let mut kb = StaticKnowledgeBase::new();
        kb.insert(
            "rating of CS106B",
            KBAnswer {
                rows: vec![],
                answer: "4.3 average".into(),
            },
        );
        let answer = kb.run("Courses", "  Rating of   cs106b ").await.unwrap();
        assert_eq!(answer.answer, "4.3 average");
        assert!(kb.run("Courses", "rating of CS107").await.is_err());
    }

    #[tokio::test]
    async fn test_database_specific_entries() {
        let mut kb = StaticKnowledgeBase::new();
        kb.insert_for(
            "Courses",
            "units of CS106B",
            KBAnswer {
                rows: vec![],
                answer: "5".into(),
            },
        );
        assert!(kb.run("Courses", "units of CS106B").await.is_ok());
        assert!(kb.run("Restaurants", "units of CS106B").await.is_err());
    }

    #[tokio::test]
    async fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.toml");
        std::fs::write(
            &path,
            r#"
[[entry]]
database = "Courses"
query = "rating of CS106B"
answer = "4.3 average"
rows = [{ course = "CS106B", rating = 4.3 }]
"#,
        )
        .unwrap();
        let kb = StaticKnowledgeBase::from_file(&path).unwrap();
        let answer = kb.run("Courses", "rating of CS106B").await.unwrap();
        assert_eq!(answer.rows.len(), 1);
        assert_eq!(answer.rows[0]["rating"], 4.3);
    }
}
