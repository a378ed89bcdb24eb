use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::tensor::{VarKind, Variable};

/// A shared reference to a variable owned by a scope.
#[derive(Debug, Clone)]
pub struct VarHandle {
    name: Arc<str>,
    var: Arc<RwLock<Variable>>,
}

impl VarHandle {
    pub(super) fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            var: Arc::new(RwLock::new(Variable::Uninit)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The kind currently held, `None` while uninitialized.
    pub fn kind(&self) -> Option<VarKind> {
        self.var.read().kind()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Variable> {
        self.var.read()
    }

    /// Replaces the held value.
    ///
    /// # Panics
    /// If the variable already holds a value of another kind.
    pub fn set(&self, value: Variable) {
        let mut var = self.var.write();

        if let (Some(held), Some(new)) = (var.kind(), value.kind()) {
            assert_eq!(
                held, new,
                "variable `{}` already holds a {held}, can't store a {new}",
                self.name
            );
        }

        *var = value;
    }

    /// Whether both handles refer to the same variable.
    pub fn same_var(&self, other: &VarHandle) -> bool {
        Arc::ptr_eq(&self.var, &other.var)
    }
}
