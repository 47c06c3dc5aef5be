//! 策略：代理行为与不动点扫描引擎

pub mod acts;
pub mod engine;

pub use acts::{AgentAct, AgentActs};
pub use engine::{PolicyEngine, PolicySettings};
