//! 知识库接入
//!
//! 策略在 ResolvingKB 阶段把参数齐全的 KBQueryRecord 交给 KnowledgeBase 执行，
//! 同一时刻只有一个查询在途。

pub mod static_kb;

pub use static_kb::StaticKnowledgeBase;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 查询结果：原始行 + 一句可直接 Report 的回答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KBAnswer {
    #[serde(default)]
    pub rows: Vec<serde_json::Value>,
    pub answer: String,
}

/// 知识库后端
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// database 为知识库工作表名，query 为已代入参数的形式化查询
    async fn run(&self, database: &str, query: &str) -> Result<KBAnswer, String>;
}
