//! Worksheets - 声明式工作表驱动的任务型对话引擎
//!
//! 模块划分：
//! - **template**: 工作表模板、注册表、构建器与规格文件加载
//! - **predicate**: 受限谓词语法与三值求值
//! - **action**: 受限动作语句、外部 API 注册表与带超时的执行器
//! - **state**: 字段值、任务记录、状态增量、对话状态与持久化
//! - **knowledge**: 知识库接入（静态表）
//! - **policy**: 代理行为与不动点策略引擎
//! - **session**: 会话循环、语义解析器 / 回复生成器接缝
//! - **core**: 错误分类与失败恢复
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: 日志订阅器

pub mod action;
pub mod config;
pub mod core;
pub mod knowledge;
pub mod observability;
pub mod policy;
pub mod predicate;
pub mod session;
pub mod state;
pub mod template;

pub use crate::core::{MergeError, SpecError, WorksheetError};
pub use policy::{AgentAct, PolicyEngine, PolicySettings};
pub use session::{Session, TurnOutput};
pub use state::{DialogueState, StateDelta};
pub use template::TemplateRegistry;
