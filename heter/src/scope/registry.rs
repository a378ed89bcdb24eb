use std::{collections::HashMap, sync::Arc};

use comms::specs::RemoteErrKind;
use log::debug;
use parking_lot::RwLock;

use super::Scope;
use crate::error::{HeterErr, Result};

/// Owns the root scope plus the live mini-batch and micro-batch scopes, keyed by id.
///
/// Micro-batch scopes are children of their mini-batch scope, which is a child of the root.
#[derive(Debug)]
pub struct ScopeRegistry {
    root: Arc<Scope>,
    mini: RwLock<HashMap<u64, Arc<Scope>>>,
    micro: RwLock<HashMap<u64, Vec<Arc<Scope>>>>,
}

impl ScopeRegistry {
    /// Creates a new `ScopeRegistry` around an existing root scope.
    pub fn new(root: Arc<Scope>) -> Self {
        Self {
            root,
            mini: RwLock::new(HashMap::new()),
            micro: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Arc<Scope> {
        &self.root
    }

    /// Returns the scope of mini-batch `id`, creating it if absent.
    pub fn create_mini_batch(&self, id: u64) -> Arc<Scope> {
        Arc::clone(
            self.mini
                .write()
                .entry(id)
                .or_insert_with(|| self.root.new_child()),
        )
    }

    /// Creates `count` micro-batch scopes under mini-batch `mini`, replacing any previous ones.
    ///
    /// # Returns
    /// The new micro-batch scopes, indexed by micro-batch id.
    pub fn create_micro_batches(&self, mini: u64, count: usize) -> Vec<Arc<Scope>> {
        let parent = self.create_mini_batch(mini);
        parent.drop_kids();

        let scopes: Vec<_> = (0..count).map(|_| parent.new_child()).collect();
        self.micro.write().insert(mini, scopes.clone());

        debug!(mini_batch = mini, micro_batches = count; "created micro-batch scopes");
        scopes
    }

    pub fn mini_batch(&self, id: u64) -> Option<Arc<Scope>> {
        self.mini.read().get(&id).cloned()
    }

    pub fn micro_batch(&self, mini: u64, micro: u64) -> Option<Arc<Scope>> {
        let micro = usize::try_from(micro).ok()?;
        self.micro.read().get(&mini)?.get(micro).cloned()
    }

    /// Destroys mini-batch `id` and all of its micro-batch scopes.
    pub fn release_mini_batch(&self, id: u64) {
        self.micro.write().remove(&id);

        if let Some(scope) = self.mini.write().remove(&id) {
            scope.drop_kids();
            self.root.drop_kid(&scope);
        }

        debug!(mini_batch = id; "released mini-batch scope");
    }

    /// Resolves the scope a request is addressed to.
    ///
    /// # Arguments
    /// * `mini` - The mini-batch id of the request, if any.
    /// * `micro` - The micro-batch id of the request, if any.
    ///
    /// # Returns
    /// The root scope when no id is given, otherwise the addressed scope or a
    /// protocol error when it isn't alive.
    pub fn resolve(&self, mini: Option<u64>, micro: Option<u64>) -> Result<Arc<Scope>> {
        match (mini, micro) {
            (None, None) => Ok(Arc::clone(&self.root)),
            (Some(mini), None) => self.mini_batch(mini).ok_or_else(|| {
                HeterErr::protocol(
                    RemoteErrKind::UnknownScope,
                    format!("mini-batch {mini} has no live scope"),
                )
            }),
            (Some(mini), Some(micro)) => self.micro_batch(mini, micro).ok_or_else(|| {
                HeterErr::protocol(
                    RemoteErrKind::UnknownScope,
                    format!("micro-batch {micro} of mini-batch {mini} has no live scope"),
                )
            }),
            (None, Some(micro)) => Err(HeterErr::malformed(format!(
                "micro-batch {micro} addressed without a mini-batch id"
            ))),
        }
    }
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        Self::new(Scope::root())
    }
}
