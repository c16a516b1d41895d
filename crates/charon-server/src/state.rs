//! Shared application state

use charon_cloud::CloudProvider;
use charon_core::{AppConfig, Store};
use std::sync::Arc;

use crate::auth::TokenVerifier;
use crate::services::reconciler::Reconciler;
use crate::services::resolver::FilesystemResolver;
use crate::services::scheduler::Scheduler;

/// Everything a handler or control loop needs
///
/// All mutable state lives behind the store; this struct is cheap to clone
/// per request.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub cloud: Arc<dyn CloudProvider>,
    pub config: Arc<AppConfig>,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl AppState {
    pub fn new(
        store: Store,
        cloud: Arc<dyn CloudProvider>,
        config: Arc<AppConfig>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            store,
            cloud,
            config,
            verifier,
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.store.clone(), self.cloud.clone(), self.config.clone())
    }

    pub fn resolver(&self) -> FilesystemResolver {
        FilesystemResolver::new(self.store.clone(), self.cloud.clone(), self.config.clone())
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.store.clone(), self.cloud.clone(), self.config.clone())
    }
}
