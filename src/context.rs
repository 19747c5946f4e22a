//! Shared broker state handed to every session.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::fanout::{Bus, NullBus};
use crate::hook::{DefaultHook, Hook};
use crate::retain::{DefaultRetainStorage, RetainStorage};
use crate::retry::RetryScheduler;
use crate::router::DefaultRouter;
use crate::settings::Settings;
use crate::shared::DefaultShared;

/// Cheaply cloneable handle to everything a session needs: settings, the
/// session registry, the subscription router, retained storage, hooks, the
/// bus and the retry scheduler.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub settings: Settings,
    pub shared: DefaultShared,
    pub router: DefaultRouter,
    pub retain: Arc<dyn RetainStorage>,
    pub hook: Arc<dyn Hook>,
    pub bus: Arc<dyn Bus>,
    pub retry: RetryScheduler,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("settings", &self.settings)
            .field("sessions", &self.shared.sessions_count())
            .finish()
    }
}

impl ServerContext {
    pub fn new() -> ServerContextBuilder {
        ServerContextBuilder::default()
    }
}

#[derive(Default)]
pub struct ServerContextBuilder {
    settings: Option<Settings>,
    hook: Option<Arc<dyn Hook>>,
    bus: Option<Arc<dyn Bus>>,
    retain: Option<Arc<dyn RetainStorage>>,
}

impl ServerContextBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn retain(mut self, retain: Arc<dyn RetainStorage>) -> Self {
        self.retain = Some(retain);
        self
    }

    pub fn build(self) -> ServerContext {
        let settings = self.settings.unwrap_or_default();
        let retry = RetryScheduler::new(settings.base_retry_timeout(), settings.retry_sweep_interval());
        ServerContext {
            inner: Arc::new(ServerContextInner {
                settings,
                shared: DefaultShared::new(),
                router: DefaultRouter::new(),
                retain: self.retain.unwrap_or_else(|| Arc::new(DefaultRetainStorage::new())),
                hook: self.hook.unwrap_or_else(|| Arc::new(DefaultHook)),
                bus: self.bus.unwrap_or_else(|| Arc::new(NullBus)),
                retry,
            }),
        }
    }
}
