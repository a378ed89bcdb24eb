//! Heterogeneous send and receive: moves named variables between the stages of a
//! pipelined training job and tells the local training loop when they landed.

pub mod client;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod handler;
pub mod scope;
pub mod service;
pub mod task_queue;
pub mod tensor;

pub use client::{ClientRegistry, HeterClient, RetryPolicy, SendAndRecvOp};
pub use config::{HeterConfig, RetryConfig};
pub use device::{DeviceBuffer, DeviceContext, HostContext, Place, SimDevice};
pub use error::{HeterErr, Result};
pub use executor::Executor;
pub use handler::SendAndRecvHandler;
pub use scope::{Scope, ScopeRegistry, VarHandle};
pub use service::{HeterServer, ServerBuilder, ServerState, ServiceHandler};
pub use task_queue::{QueueErr, TaskEntry, TaskQueue};
pub use tensor::{DType, Element, SparseRows, Tensor, VarKind, Variable};
