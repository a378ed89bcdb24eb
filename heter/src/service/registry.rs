use std::{collections::HashMap, fmt, sync::Arc};

use comms::msg::VarBatch;

use crate::error::{HeterErr, Result};

/// Serves the requests addressed to one channel.
///
/// Handlers are called from the connection tasks through `block_in_place`, so they
/// may block but must be safe to call from many connections at once.
pub trait ServiceHandler: Send + Sync {
    /// Handles `request`.
    ///
    /// # Returns
    /// The response batch, or an error that is sent back to the peer as a `RemoteErr`.
    fn handle(&self, request: &VarBatch<'_>) -> Result<VarBatch<'static>>;
}

impl<F> ServiceHandler for F
where
    F: Fn(&VarBatch<'_>) -> Result<VarBatch<'static>> + Send + Sync,
{
    fn handle(&self, request: &VarBatch<'_>) -> Result<VarBatch<'static>> {
        self(request)
    }
}

/// Collects the handlers of a server before it starts serving.
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: HashMap<String, Arc<dyn ServiceHandler>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `channel`.
    ///
    /// # Returns
    /// A `Config` error if the channel already has a handler.
    pub fn register(&mut self, channel: &str, handler: Arc<dyn ServiceHandler>) -> Result<()> {
        if self.handlers.contains_key(channel) {
            return Err(HeterErr::Config(format!(
                "channel `{channel}` already has a handler"
            )));
        }

        self.handlers.insert(channel.to_string(), handler);
        Ok(())
    }

    /// Freezes the registrations.
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// The frozen channel to handler table shared by every connection task.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, Arc<dyn ServiceHandler>>>,
}

impl HandlerRegistry {
    pub fn get(&self, channel: &str) -> Option<&Arc<dyn ServiceHandler>> {
        self.handlers.get(channel)
    }

    /// The registered channels, sorted.
    pub fn channels(&self) -> Vec<&str> {
        let mut channels: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        channels.sort_unstable();
        channels
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("channels", &self.channels())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Arc<dyn ServiceHandler> {
        Arc::new(|req: &VarBatch<'_>| Ok(VarBatch::ack(&req.header)))
    }

    #[test]
    fn test_duplicate_channel_is_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.register("x", echo()).unwrap();

        let err = builder.register("x", echo()).unwrap_err();
        assert!(matches!(err, HeterErr::Config(_)));
    }

    #[test]
    fn test_frozen_registry_lookup() {
        let mut builder = RegistryBuilder::new();
        builder.register("b", echo()).unwrap();
        builder.register("a", echo()).unwrap();

        let registry = builder.build();
        let shared = registry.clone();

        assert_eq!(shared.channels(), ["a", "b"]);
        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_none());
    }
}
