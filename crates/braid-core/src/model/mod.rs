//! Domain entities: templates, instances, tasks, subdivisions, events and
//! the task context payload.

pub mod event;
pub mod instance;
pub mod payload;
pub mod subdivision;
pub mod task;
pub mod template;

pub use event::{ContextSnapshot, EventKind, WorkflowEvent};
pub use instance::{NodeInstance, NodeInstanceStatus, WorkflowInstance, WorkflowInstanceStatus};
pub use payload::{Attachment, ContextPayload, WorkflowMeta};
pub use subdivision::{SubdivisionStatus, TaskSubdivision};
pub use task::{TaskInstance, TaskKind, TaskStatus};
pub use template::{
    ConditionOp, EdgeCondition, Node, NodeConnection, NodeProcessor, NodeType, Position,
    Processor, ProcessorKind, TemplateGraph, Workflow,
};
