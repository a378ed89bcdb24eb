use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use super::{HeterClient, RetryPolicy};

type ClientKey = (Vec<String>, Vec<String>, u32);

/// The process wide set of clients, one per addressing.
///
/// Clients share nothing but their retry policy, each keeps its own connection pool.
#[derive(Default)]
pub struct ClientRegistry {
    retry: RetryPolicy,
    clients: Mutex<HashMap<ClientKey, Arc<HeterClient>>>,
}

impl ClientRegistry {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the client for this addressing, creating it on first use.
    ///
    /// # Arguments
    /// * `endpoints` - The servers of the next stage.
    /// * `previous_endpoints` - The servers of the previous stage.
    /// * `trainer_id` - The id of the calling trainer.
    pub fn get_or_create(
        &self,
        endpoints: &[String],
        previous_endpoints: &[String],
        trainer_id: u32,
    ) -> Arc<HeterClient> {
        let key = (endpoints.to_vec(), previous_endpoints.to_vec(), trainer_id);

        let mut clients = self.clients.lock();
        let client = clients.entry(key).or_insert_with(|| {
            Arc::new(HeterClient::new(
                endpoints.to_vec(),
                previous_endpoints.to_vec(),
                trainer_id,
                self.retry.clone(),
            ))
        });

        Arc::clone(client)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = ClientRegistry::default();
        let next = vec!["127.0.0.1:7000".to_string()];
        let prev = vec!["127.0.0.1:6000".to_string()];

        let first = registry.get_or_create(&next, &prev, 0);
        let second = registry.get_or_create(&next, &prev, 0);
        assert!(Arc::ptr_eq(&first, &second));

        let other = registry.get_or_create(&next, &prev, 1);
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
    }
}
