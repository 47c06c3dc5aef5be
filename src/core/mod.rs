//! 核心：错误分类与恢复

pub mod error;
pub mod recovery;

pub use error::{
    ActionError, KnowledgeError, MergeError, PredicateError, RegistryError, SpecError,
    WorksheetError,
};
pub use recovery::RecoveryEngine;
