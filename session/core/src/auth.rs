//! Authentication State
//!
//! Decides whether a session is authenticated, a guest, or neither, and keeps
//! the persisted guest flag consistent with that decision.

use std::path::Path;
use std::sync::Arc;

use crate::api::{AccountApi, ApiError, ApiUser, RegisterRequest};
use crate::storage::{LocalStore, AVATAR_OVERRIDE_KEY};

/// Authentication flags as surfaces and the session controller see them
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthState {
    /// A backend session cookie is valid
    pub authenticated: bool,
    /// The user chose to chat as a guest
    pub guest_mode: bool,
    /// The signed-in user, when known
    pub user: Option<ApiUser>,
}

/// Login, logout, guest activation and profile bits
pub struct AuthManager<A: AccountApi> {
    api: Arc<A>,
    store: Arc<dyn LocalStore>,
    backend_url: String,
    state: AuthState,
}

impl<A: AccountApi> AuthManager<A> {
    /// Create a manager; call [`AuthManager::initialize`] before use
    pub fn new(api: Arc<A>, store: Arc<dyn LocalStore>, backend_url: impl Into<String>) -> Self {
        Self {
            api,
            store,
            backend_url: backend_url.into().trim_end_matches('/').to_string(),
            state: AuthState::default(),
        }
    }

    /// Current flags
    #[must_use]
    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// Probe the backend session
    ///
    /// A valid session cookie means authenticated. Otherwise guest mode
    /// follows the persisted flag.
    pub async fn initialize(&mut self) -> &AuthState {
        match self.api.me().await {
            Ok(user) => {
                tracing::info!(user = %user.username, "Session authenticated");
                self.state = AuthState {
                    authenticated: true,
                    guest_mode: false,
                    user: Some(user),
                };
            }
            Err(e) => {
                let guest_mode = self.store.is_local_guest();
                tracing::info!(error = %e, guest_mode, "No authenticated session");
                self.state = AuthState {
                    authenticated: false,
                    guest_mode,
                    user: None,
                };
            }
        }
        &self.state
    }

    /// Sign in and leave guest mode
    ///
    /// # Errors
    ///
    /// Returns the API error when the credentials are rejected.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<&AuthState, ApiError> {
        let response = self.api.login(username, password).await?;
        self.store.set_local_guest(false);
        tracing::info!(user = %response.user.username, "Logged in");
        self.state = AuthState {
            authenticated: true,
            guest_mode: false,
            user: Some(response.user),
        };
        Ok(&self.state)
    }

    /// Create an account; does not sign in
    ///
    /// # Errors
    ///
    /// Returns the API error, e.g. a validation message.
    pub async fn register(&self, request: &RegisterRequest) -> Result<ApiUser, ApiError> {
        self.api.register(request).await
    }

    /// Sign out and clear the guest flag
    ///
    /// Logout failures are logged; local state is cleared regardless.
    pub async fn logout(&mut self) -> &AuthState {
        if let Err(e) = self.api.logout().await {
            tracing::warn!(error = %e, "Logout request failed");
        }
        self.store.set_local_guest(false);
        self.state = AuthState::default();
        &self.state
    }

    /// Enter guest mode
    pub fn activate_guest_mode(&mut self) -> &AuthState {
        self.store.set_local_guest(true);
        self.state = AuthState {
            authenticated: false,
            guest_mode: true,
            user: None,
        };
        tracing::info!("Guest mode activated");
        &self.state
    }

    /// Change the password
    ///
    /// # Errors
    ///
    /// Returns the API error when the current password is wrong or the new
    /// one is rejected.
    pub async fn change_password(&self, current: &str, new: &str) -> Result<String, ApiError> {
        self.api.change_password(current, new).await
    }

    /// Upload a new avatar and remember its URL as the override
    ///
    /// # Errors
    ///
    /// Returns the API or IO error from the upload.
    pub async fn update_avatar(&mut self, path: &Path) -> Result<Option<String>, ApiError> {
        let user = self.api.upload_avatar(path).await?;
        self.set_avatar_override(user.avatar_url.as_deref());
        self.state.user = Some(user);
        Ok(self.avatar_url())
    }

    /// Set or clear the avatar override
    pub fn set_avatar_override(&self, url: Option<&str>) {
        match url {
            Some(url) => self.store.set(AVATAR_OVERRIDE_KEY, url),
            None => self.store.remove(AVATAR_OVERRIDE_KEY),
        }
    }

    /// Avatar to display: the override if set, else the profile's
    #[must_use]
    pub fn avatar_url(&self) -> Option<String> {
        self.store
            .get(AVATAR_OVERRIDE_KEY)
            .or_else(|| self.state.user.as_ref()?.avatar_url.clone())
            .map(|url| self.normalize_url(&url))
    }

    /// Resolve a backend-relative URL against the backend origin
    #[must_use]
    pub fn normalize_url(&self, url: &str) -> String {
        if url.starts_with("http") || url.starts_with("blob:") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{url}", self.backend_url)
        } else {
            url.to_string()
        }
    }
}
