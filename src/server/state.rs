use std::sync::Arc;

use crate::auth::TokenValidator;
use crate::config::Settings;
use crate::hub::{
    BroadcastRouter, Clock, ConnectionRegistry, EventPublisher, SubscriptionManager, SystemClock,
};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub token_validator: Arc<TokenValidator>,
    pub registry: Arc<ConnectionRegistry>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub router: Arc<BroadcastRouter>,
    pub publisher: Arc<EventPublisher>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// Build the hub against an explicit time source; tests inject a manual
    /// clock here.
    pub fn with_clock(settings: Settings, clock: Arc<dyn Clock>) -> Self {
        let token_validator = Arc::new(TokenValidator::new(&settings.auth));
        let registry = Arc::new(ConnectionRegistry::new(clock));
        let subscriptions = Arc::new(SubscriptionManager::new());
        let router = Arc::new(BroadcastRouter::new(registry.clone(), subscriptions.clone()));
        let publisher = Arc::new(EventPublisher::new(
            registry.clone(),
            subscriptions.clone(),
            router.clone(),
        ));

        Self {
            settings: Arc::new(settings),
            token_validator,
            registry,
            subscriptions,
            router,
            publisher,
        }
    }
}
