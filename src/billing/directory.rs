//! External user directory and session registrar seams.
//!
//! Checkout processing needs two collaborators outside the billing engine:
//! the account system that owns user records ([`UserDirectory`]) and the
//! session layer that hands a logged-in token to freshly paid users
//! ([`SessionRegistrar`]). Both are traits so the host application decides
//! where users and sessions actually live.

use crate::error::Result;
use uuid::Uuid;

use super::plans::PlanTier;

/// A user record as seen by the billing engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryUser {
    /// Directory-owned user ID.
    pub id: Uuid,
    /// Primary email address.
    pub email: String,
    /// Display name.
    pub name: String,
    /// Plan currently held by the user.
    pub plan: PlanTier,
}

/// Trait for the external account system.
#[allow(async_fn_in_trait)]
pub trait UserDirectory: Send + Sync {
    /// Look up a user by directory id.
    async fn find_by_id(&self, id: Uuid) -> Result<Option<DirectoryUser>>;

    /// Look up a user by email.
    async fn find_by_email(&self, email: &str) -> Result<Option<DirectoryUser>>;

    /// Look up a user by email, creating one on the given plan if absent.
    ///
    /// New users get a display name derived from the email local part
    /// (see [`display_name_from_email`]).
    async fn find_or_create(&self, email: &str, plan: PlanTier) -> Result<DirectoryUser>;

    /// Move an existing user onto a plan.
    async fn assign_plan(&self, user_id: Uuid, plan: PlanTier) -> Result<()>;
}

/// Trait for the session layer.
///
/// Single-session enforcement (one live token per account) is the
/// implementation's concern; the billing engine only issues and registers.
#[allow(async_fn_in_trait)]
pub trait SessionRegistrar: Send + Sync {
    /// Issue a fresh session token for the account.
    async fn issue_token(&self, email: &str) -> Result<String>;

    /// Register the token as the account's active session.
    async fn register_active_token(&self, email: &str, token: &str) -> Result<()>;
}

/// Derive a display name from the local part of an email address.
///
/// `joao.silva@example.com` becomes `Joao Silva`. Falls back to the full
/// input when there is nothing before the `@`.
#[must_use]
pub fn display_name_from_email(email: &str) -> String {
    let local = email.split('@').next().unwrap_or(email);
    if local.is_empty() {
        return email.to_string();
    }

    local
        .split(['.', '_', '-'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Mock directory and registrar for testing.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use crate::billing::error::BillingError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, RwLock};

    /// Mock user directory backed by a map keyed on lowercased email.
    #[derive(Default, Clone)]
    pub struct MockUserDirectory {
        inner: Arc<MockUserDirectoryInner>,
    }

    #[derive(Default)]
    struct MockUserDirectoryInner {
        users: RwLock<HashMap<String, DirectoryUser>>,
        assigned: RwLock<Vec<(Uuid, PlanTier)>>,
    }

    impl MockUserDirectory {
        /// Create a new empty mock directory.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Insert a user directly, returning the created record.
        pub fn seed_user(&self, email: &str, plan: PlanTier) -> DirectoryUser {
            let user = DirectoryUser {
                id: Uuid::new_v4(),
                email: email.to_string(),
                name: display_name_from_email(email),
                plan,
            };
            self.inner
                .users
                .write()
                .unwrap()
                .insert(email.to_lowercase(), user.clone());
            user
        }

        /// All `assign_plan` calls recorded so far.
        pub fn assigned_plans(&self) -> Vec<(Uuid, PlanTier)> {
            self.inner.assigned.read().unwrap().clone()
        }

        /// Number of users currently in the directory.
        pub fn user_count(&self) -> usize {
            self.inner.users.read().unwrap().len()
        }
    }

    impl UserDirectory for MockUserDirectory {
        async fn find_by_id(&self, id: Uuid) -> Result<Option<DirectoryUser>> {
            Ok(self
                .inner
                .users
                .read()
                .unwrap()
                .values()
                .find(|user| user.id == id)
                .cloned())
        }

        async fn find_by_email(&self, email: &str) -> Result<Option<DirectoryUser>> {
            Ok(self
                .inner
                .users
                .read()
                .unwrap()
                .get(&email.to_lowercase())
                .cloned())
        }

        async fn find_or_create(&self, email: &str, plan: PlanTier) -> Result<DirectoryUser> {
            let mut users = self.inner.users.write().unwrap();
            if let Some(existing) = users.get(&email.to_lowercase()) {
                return Ok(existing.clone());
            }

            let user = DirectoryUser {
                id: Uuid::new_v4(),
                email: email.to_string(),
                name: display_name_from_email(email),
                plan,
            };
            users.insert(email.to_lowercase(), user.clone());
            Ok(user)
        }

        async fn assign_plan(&self, user_id: Uuid, plan: PlanTier) -> Result<()> {
            let mut users = self.inner.users.write().unwrap();
            let user = users
                .values_mut()
                .find(|u| u.id == user_id)
                .ok_or_else(|| BillingError::UserNotFound {
                    user_ref: user_id.to_string(),
                })?;
            user.plan = plan;
            self.inner.assigned.write().unwrap().push((user_id, plan));
            Ok(())
        }
    }

    /// Mock session registrar that keeps one active token per email.
    #[derive(Default, Clone)]
    pub struct MockSessionRegistrar {
        inner: Arc<MockSessionRegistrarInner>,
    }

    #[derive(Default)]
    struct MockSessionRegistrarInner {
        token_counter: AtomicU64,
        fail_registrations: AtomicBool,
        active: RwLock<HashMap<String, String>>,
        registrations: RwLock<Vec<(String, String)>>,
    }

    impl MockSessionRegistrar {
        /// Create a new mock registrar.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Error every registration attempt.
        pub fn fail_registrations(&self) {
            self.inner.fail_registrations.store(true, Ordering::SeqCst);
        }

        /// The currently active token for an email, if any.
        pub fn active_token(&self, email: &str) -> Option<String> {
            self.inner
                .active
                .read()
                .unwrap()
                .get(&email.to_lowercase())
                .cloned()
        }

        /// All registrations recorded so far, in order.
        pub fn registrations(&self) -> Vec<(String, String)> {
            self.inner.registrations.read().unwrap().clone()
        }
    }

    impl SessionRegistrar for MockSessionRegistrar {
        async fn issue_token(&self, _email: &str) -> Result<String> {
            let id = format!(
                "sess_mock_{}",
                self.inner.token_counter.fetch_add(1, Ordering::SeqCst)
            );
            Ok(id)
        }

        async fn register_active_token(&self, email: &str, token: &str) -> Result<()> {
            if self.inner.fail_registrations.load(Ordering::SeqCst) {
                return Err(BillingError::Internal {
                    message: "scripted registrar failure".to_string(),
                }
                .into());
            }

            // Replaces any previous token, enforcing a single live session.
            self.inner
                .active
                .write()
                .unwrap()
                .insert(email.to_lowercase(), token.to_string());
            self.inner
                .registrations
                .write()
                .unwrap()
                .push((email.to_string(), token.to_string()));
            Ok(())
        }
    }
}
