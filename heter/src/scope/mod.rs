//! Hierarchical variable namespaces isolating concurrent in-flight requests.

mod handle;
mod registry;

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock};

pub use handle::VarHandle;
pub use registry::ScopeRegistry;

use crate::tensor::VarKind;

/// A node in the scope tree.
///
/// Lookups walk up to the parent on a miss, writes only ever land in the scope itself.
/// A parent owns its kids, a kid only keeps a weak link back.
#[derive(Debug, Default)]
pub struct Scope {
    parent: Weak<Scope>,
    vars: RwLock<HashMap<String, VarHandle>>,
    kids: Mutex<Vec<Arc<Scope>>>,
}

impl Scope {
    /// Creates a new root scope.
    pub fn root() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a child scope owned by this one.
    pub fn new_child(self: &Arc<Self>) -> Arc<Scope> {
        let kid = Arc::new(Scope {
            parent: Arc::downgrade(self),
            ..Default::default()
        });

        self.kids.lock().push(Arc::clone(&kid));
        kid
    }

    /// The parent scope, `None` for a root or once the parent was dropped.
    pub fn parent(&self) -> Option<Arc<Scope>> {
        self.parent.upgrade()
    }

    /// Returns the local variable named `name`, creating an uninitialized one if absent.
    ///
    /// Never looks at the parent scopes.
    pub fn var(&self, name: &str) -> VarHandle {
        if let Some(handle) = self.vars.read().get(name) {
            return handle.clone();
        }

        self.vars
            .write()
            .entry(name.to_string())
            .or_insert_with(|| VarHandle::new(name))
            .clone()
    }

    /// Same as `var` but asserts the variable can hold a value of `kind`.
    ///
    /// # Panics
    /// If the variable already holds a value of another kind.
    pub fn var_of(&self, name: &str, kind: VarKind) -> VarHandle {
        let handle = self.var(name);

        if let Some(held) = handle.kind() {
            assert_eq!(
                held, kind,
                "variable `{name}` already holds a {held}, can't use it as a {kind}"
            );
        }

        handle
    }

    /// Looks `name` up in this scope and then in every ancestor.
    pub fn find(&self, name: &str) -> Option<VarHandle> {
        if let Some(handle) = self.find_local(name) {
            return Some(handle);
        }

        let mut current = self.parent();

        while let Some(scope) = current {
            if let Some(handle) = scope.find_local(name) {
                return Some(handle);
            }

            current = scope.parent();
        }

        None
    }

    /// Looks `name` up in this scope only.
    pub fn find_local(&self, name: &str) -> Option<VarHandle> {
        self.vars.read().get(name).cloned()
    }

    /// Removes the named local variables, missing names are ignored.
    pub fn erase<S: AsRef<str>>(&self, names: &[S]) {
        let mut vars = self.vars.write();

        for name in names {
            vars.remove(name.as_ref());
        }
    }

    /// The names of the variables owned by this scope, sorted.
    pub fn local_var_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.vars.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn kids(&self) -> Vec<Arc<Scope>> {
        self.kids.lock().clone()
    }

    /// Releases every child scope.
    pub fn drop_kids(&self) {
        self.kids.lock().clear();
    }

    /// Releases a single child scope.
    pub fn drop_kid(&self, kid: &Arc<Scope>) {
        self.kids.lock().retain(|k| !Arc::ptr_eq(k, kid));
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::tensor::{Tensor, Variable};

    #[test]
    fn test_var_is_create_if_absent() {
        let scope = Scope::root();
        let first = scope.var("x");
        let second = scope.var("x");
        assert!(first.same_var(&second));
    }

    #[test]
    fn test_find_walks_up_but_var_stays_local() {
        let root = Scope::root();
        root.var("x")
            .set(Variable::Dense(Tensor::from_slice(vec![1], &[7.0f32])));

        let kid = root.new_child();
        let found = kid.find("x").unwrap();
        assert!(found.same_var(&root.var("x")));
        assert!(kid.find_local("x").is_none());

        let local = kid.var("x");
        assert!(!local.same_var(&found));
        assert!(local.read().kind().is_none());
        assert_eq!(root.local_var_names(), ["x"]);
    }

    #[test]
    fn test_find_misses_everywhere() {
        let root = Scope::root();
        let kid = root.new_child().new_child();
        assert!(kid.find("nope").is_none());
    }

    #[test]
    #[should_panic(expected = "already holds a dense tensor")]
    fn test_kind_conflict_is_fatal() {
        let scope = Scope::root();
        scope
            .var("w")
            .set(Variable::Dense(Tensor::from_slice(vec![1], &[1u8])));

        scope.var_of("w", VarKind::SparseRows);
    }

    #[test]
    fn test_drop_kids_releases_children() {
        let root = Scope::root();
        let kid = root.new_child();
        let weak = Arc::downgrade(&kid);
        drop(kid);

        assert_eq!(root.kids().len(), 1);
        root.drop_kids();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_concurrent_var_creation_yields_one_handle() {
        let scope = Scope::root();

        let handles: Vec<_> = thread::scope(|s| {
            let workers: Vec<_> = (0..8).map(|_| s.spawn(|| scope.var("shared"))).collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert!(handles.windows(2).all(|w| w[0].same_var(&w[1])));
    }

    #[test]
    fn test_erase() {
        let scope = Scope::root();
        scope.var("a");
        scope.var("b");
        scope.erase(&["a", "missing"]);
        assert_eq!(scope.local_var_names(), ["b"]);
    }
}
