//! Store configuration and hooks.

use std::sync::Arc;
use std::time::Duration;

use replica_core::{Operation, Projection};
use serde_json::Value;

use crate::channel::ChannelId;
use crate::pubsub::PubSub;

/// Who sent an operation, passed to the pre-hook.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub channel_id: ChannelId,
    /// Collection name as the client addressed it (a projection name or the base name)
    pub collection_name: String,
}

/// Runs before an operation is applied. `Err(reason)` rejects it.
pub type PreHook = Arc<dyn Fn(&Operation, &HookContext) -> Result<(), String> + Send + Sync>;

/// Runs once the operation is durably saved. Receives the value the target
/// field (or whole document) had before the operation was applied.
pub type AfterHook = Arc<dyn Fn(&Operation, Option<&Value>) + Send + Sync>;

#[derive(Clone)]
pub struct StoreOptions {
    /// Coalesce saves into one write per interval; `None` saves immediately
    pub save_debounce: Option<Duration>,
    /// How long an unsubscribed doc or query stays in memory
    pub unattach_grace: Duration,
    pub projections: Vec<Projection>,
    pub pre_hook: Option<PreHook>,
    pub after_hook: Option<AfterHook>,
    /// Cross-process invalidation bus
    pub pubsub: Option<Arc<dyn PubSub>>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            save_debounce: None,
            unattach_grace: Duration::from_secs(5),
            projections: Vec::new(),
            pre_hook: None,
            after_hook: None,
            pubsub: None,
        }
    }
}

impl StoreOptions {
    /// Short grace period so tests can observe unattachment.
    pub fn for_testing() -> Self {
        Self {
            unattach_grace: Duration::from_millis(50),
            ..Self::default()
        }
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projections.push(projection);
        self
    }

    pub fn with_pre_hook(
        mut self,
        hook: impl Fn(&Operation, &HookContext) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.pre_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_after_hook(mut self, hook: impl Fn(&Operation, Option<&Value>) + Send + Sync + 'static) -> Self {
        self.after_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    pub fn with_save_debounce(mut self, interval: Duration) -> Self {
        self.save_debounce = Some(interval);
        self
    }
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("save_debounce", &self.save_debounce)
            .field("unattach_grace", &self.unattach_grace)
            .field("projections", &self.projections)
            .field("pre_hook", &self.pre_hook.is_some())
            .field("after_hook", &self.after_hook.is_some())
            .field("pubsub", &self.pubsub.is_some())
            .finish()
    }
}
