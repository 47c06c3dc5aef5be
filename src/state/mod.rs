//! 对话状态：字段值、任务与知识库记录、增量合并、持久化

pub mod delta;
pub mod persistence;
pub mod record;
pub mod store;
pub mod value;

pub use delta::{
    FieldAssignment, FieldTarget, KBParameterAssignment, KBParameterSpec, KBQueryProposal,
    StateDelta, TaskProposal,
};
pub use persistence::{SessionSnapshot, StatePersistence};
pub use record::{Initiator, KBParameter, KBQueryRecord, TaskRecord, TaskStatus};
pub use store::DialogueState;
pub use value::{FieldValue, ValueError};
