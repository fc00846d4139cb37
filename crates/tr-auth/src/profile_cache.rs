use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::client::AuthClient;
use crate::models::MinecraftProfile;

/// Callback invoked with the new cached profile
pub type ProfileListener = Arc<dyn Fn(Option<&MinecraftProfile>) + Send + Sync>;

/// Handle returned by [`ProfileCache::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Single-slot cache of the last fetched profile
///
/// Listeners only see changes made after they registered; there is no replay
/// of the current value. Notification runs on the caller's task against a
/// snapshot of the registry, so listeners may add or remove listeners.
pub struct ProfileCache {
    client: AuthClient,
    current: RwLock<Option<MinecraftProfile>>,
    listeners: RwLock<Vec<(ListenerId, ProfileListener)>>,
    next_id: AtomicU64,
}

impl ProfileCache {
    pub fn new(client: AuthClient) -> Self {
        Self {
            client,
            current: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Fetch the profile for `mc_access_token` and publish it
    ///
    /// Fetch failures are logged and published as `None`.
    pub async fn init(&self, mc_access_token: &str) -> Option<MinecraftProfile> {
        let profile = self.fetch(mc_access_token).await;
        self.publish(profile.clone());
        profile
    }

    /// Fetch without touching the cached value; failures become `None`
    pub async fn fetch(&self, mc_access_token: &str) -> Option<MinecraftProfile> {
        let profile = match self.client.fetch_profile(mc_access_token).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Failed to fetch Minecraft profile: {}", e);
                None
            }
        };

        if let Some(profile) = &profile {
            debug!("Fetched profile for {}", profile.name);
        }

        profile
    }

    /// Current cached value
    pub fn get(&self) -> Option<MinecraftProfile> {
        self.current.read().ok().and_then(|current| current.clone())
    }

    pub fn name(&self) -> Option<String> {
        self.get().map(|profile| profile.name)
    }

    pub fn id(&self) -> Option<String> {
        self.get().map(|profile| profile.id)
    }

    pub fn clear(&self) {
        self.publish(None);
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(Option<&MinecraftProfile>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push((id, Arc::new(listener)));
        }
        id
    }

    /// Returns false if `id` was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let Ok(mut listeners) = self.listeners.write() else {
            return false;
        };

        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Replace the cached value and notify listeners
    pub(crate) fn publish(&self, profile: Option<MinecraftProfile>) {
        if let Ok(mut current) = self.current.write() {
            *current = profile.clone();
        }

        let snapshot: Vec<ProfileListener> = match self.listeners.read() {
            Ok(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };

        for listener in snapshot {
            listener(profile.as_ref());
        }
    }
}

impl std::fmt::Debug for ProfileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileCache")
            .field("current", &self.get())
            .field(
                "listeners",
                &self.listeners.read().map(|l| l.len()).unwrap_or_default(),
            )
            .finish()
    }
}
