pub mod batch;
pub mod control;
pub mod variable;

pub use batch::{BACKWARD, BatchHeader, FORWARD};
pub use control::{Command, RemoteErr, RemoteErrKind};
pub use variable::{DType, Layout, VarMeta};
