use std::sync::Arc;

use crate::{error::Result, scope::Scope};

/// Runs named operators of the training program against a scope.
///
/// Operator semantics live outside this crate, the handler only needs to know
/// which variables an operator produced so it can send them back.
pub trait Executor: Send + Sync {
    /// Runs `op` with `scope` as its working scope.
    ///
    /// # Arguments
    /// * `scope` - The scope the request landed in.
    /// * `op` - The operator name.
    ///
    /// # Returns
    /// The names of the output variables, or an `Execution` error.
    fn run_operator(&self, scope: &Arc<Scope>, op: &str) -> Result<Vec<String>>;
}

impl<F> Executor for F
where
    F: Fn(&Arc<Scope>, &str) -> Result<Vec<String>> + Send + Sync,
{
    fn run_operator(&self, scope: &Arc<Scope>, op: &str) -> Result<Vec<String>> {
        self(scope, op)
    }
}
