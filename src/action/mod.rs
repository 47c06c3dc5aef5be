//! 动作：受限语句、外部 API 注册表、带超时的执行器

pub mod api;
pub mod executor;
pub mod statement;

pub use api::{ApiRegistry, EchoApi, ExternalApi, FnApi};
pub use executor::{ActionExecutor, ActionOutcome, Proposal};
pub use statement::{parse_statements, CallArg, Statement};
