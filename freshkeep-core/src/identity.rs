//! Resolution of the acting user's identifier.
//!
//! A signed-in user is identified by the provider's uid. Without a session
//! the device gets a guest identifier, generated once and kept in local
//! storage under [`DEVICE_ID_KEY`] for as long as that storage lives.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::store::{LocalStore, RemoteStore, DEVICE_ID_KEY};

/// Length of the random suffix of a guest identifier.
const GUEST_SUFFIX_LEN: usize = 9;

pub struct IdentityResolver {
    local: Arc<dyn LocalStore>,
    remote: Option<Arc<dyn RemoteStore>>,
    guest: Mutex<Option<String>>,
}

impl IdentityResolver {
    pub fn new(local: Arc<dyn LocalStore>, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        Self {
            local,
            remote,
            guest: Mutex::new(None),
        }
    }

    /// The authenticated uid if a session exists, otherwise the guest id.
    pub fn current_user_id(&self) -> String {
        match self.authenticated_user_id() {
            Some(uid) => uid,
            None => self.guest_id(),
        }
    }

    pub fn authenticated_user_id(&self) -> Option<String> {
        self.remote.as_ref().and_then(|r| r.current_user_id())
    }

    pub fn is_guest(&self) -> bool {
        self.authenticated_user_id().is_none()
    }

    /// Returns the device's guest id, creating and persisting it on first use.
    pub fn guest_id(&self) -> String {
        let mut cached = self.guest.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = cached.as_ref() {
            return id.clone();
        }

        let id = match self.local.read(DEVICE_ID_KEY) {
            Ok(Some(id)) if !id.trim().is_empty() => id.trim().to_string(),
            Ok(_) => {
                let id = generate_guest_id(Utc::now());
                match self.local.write(DEVICE_ID_KEY, &id) {
                    Ok(()) => tracing::info!("Created guest identity {}", id),
                    Err(e) => tracing::warn!("Failed to persist guest identity: {}", e),
                }
                id
            }
            Err(e) => {
                // An existing id may still be on disk; never overwrite it.
                tracing::warn!("Failed to read guest identity, using a temporary one: {}", e);
                generate_guest_id(Utc::now())
            }
        };

        *cached = Some(id.clone());
        id
    }
}

/// `guest_<millis>_<9 base36 chars>`.
pub fn generate_guest_id(now: DateTime<Utc>) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..GUEST_SUFFIX_LEN)
        .map(|_| std::char::from_digit(rng.random_range(0..36u32), 36).unwrap_or('0'))
        .collect();
    format!("guest_{}_{}", now.timestamp_millis(), suffix)
}
