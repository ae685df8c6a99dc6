//! Static handler registry: handler key → [`ToolHandler`], built at startup.
//!
//! ```ignore
//! let handlers = HandlerRegistry::builder()
//!     .register("echo", echo_handler())
//!     .register("read_file", read_file_handler())
//!     .build();
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use skillpipe_core::catalog::ToolCatalog;

use crate::handler::ToolHandler;

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl HandlerRegistryBuilder {
    /// Register a handler. A later registration under the same key wins.
    #[must_use]
    pub fn register(mut self, key: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        let key = key.into();
        if self.handlers.insert(key.clone(), handler).is_some() {
            tracing::debug!("Handler '{}' re-registered, replacing previous", key);
        }
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.handlers.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handlers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Catalog tools whose handler key has no registered handler.
    pub fn unbound_tools(&self, catalog: &dyn ToolCatalog) -> Vec<String> {
        catalog
            .tools()
            .into_iter()
            .filter(|t| !self.contains(t.handler_key()))
            .map(|t| t.id.clone())
            .collect()
    }
}
