//! Task dispatch: the two sinks ready work is routed to.
//!
//! Human tasks sit passively in the store, indexed by assignee, and are
//! read through [`human::TaskInbox`]. Agent tasks ride a FIFO queue drained
//! by the bounded worker pool in [`agent`], which talks to the external
//! endpoint through the [`client::AgentClient`] seam.

pub mod agent;
pub mod client;
pub mod human;

pub use agent::AgentWorkerPool;
pub use client::{AgentCallError, AgentClient, AgentInvocation, AgentReply, HttpAgentClient};
pub use human::{TaskDetails, TaskInbox, TaskStatistics};
