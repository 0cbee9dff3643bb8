//! Authentication manager for medgate
//!
//! Handles login, logout and password changes, plus administration of user
//! accounts and roles. Every outcome that matters for security is written to
//! the audit log.

use super::password::PasswordHasher;
use super::revocation::RevocationList;
use super::token::TokenService;
use super::types::{Claims, LoginToken, NewUser, Role, RoleSummary, User, UserId, UserSummary};
use crate::audit::{AuditRecorder, EventType, NewAuditEvent};
use crate::error::{MedgateError, Result};
use crate::storage::StorageBackend;
use crate::{Actor, RequestContext};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

const USERS: &str = "users";
const ROLES: &str = "roles";

/// Authenticates staff and manages accounts and roles
pub struct AuthManager {
    storage: Arc<dyn StorageBackend>,
    hasher: Arc<PasswordHasher>,
    tokens: Arc<TokenService>,
    revocations: Arc<RevocationList>,
    audit: Arc<AuditRecorder>,
}

impl AuthManager {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        hasher: Arc<PasswordHasher>,
        tokens: Arc<TokenService>,
        revocations: Arc<RevocationList>,
        audit: Arc<AuditRecorder>,
    ) -> Self {
        Self {
            storage,
            hasher,
            tokens,
            revocations,
            audit,
        }
    }

    // ==================== Sessions ====================

    /// Check a username and password and issue a session token.
    ///
    /// Unknown users, inactive accounts and wrong passwords all fail with
    /// [`MedgateError::InvalidCredentials`] after the same amount of hashing
    /// work. Each attempt appends one LOGIN audit row carrying the username
    /// exactly as submitted.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        ctx: &RequestContext,
    ) -> Result<(LoginToken, UserSummary)> {
        if username.is_empty() || password.is_empty() {
            return Err(MedgateError::Validation(
                "Username and password are required".to_string(),
            ));
        }

        let user = match self.storage.get_user_by_username(username).await? {
            Some(user) => user,
            None => {
                self.hasher.verify_dummy(password);
                return self
                    .reject_login(username, "Failed login attempt - user not found", ctx)
                    .await;
            }
        };

        if !self.hasher.verify(password, &user.password_hash) {
            return self
                .reject_login(username, "Failed login attempt - incorrect password", ctx)
                .await;
        }

        if !user.is_active {
            return self
                .reject_login(username, "Failed login attempt - account inactive", ctx)
                .await;
        }

        let role = self.role_of(&user).await?;
        let issued = self
            .tokens
            .issue(user.user_id, &user.username, role.role_id, &role.role_name)?;

        self.audit
            .record(
                NewAuditEvent::new(EventType::Login, USERS, username)
                    .details("Successful login")
                    .context(ctx),
            )
            .await;

        tracing::info!(
            username = %user.username,
            role = %role.role_name,
            request_id = %ctx.request_id,
            "Login successful"
        );

        Ok((
            LoginToken::bearer(issued.token, &issued.claims),
            UserSummary::new(&user, role.role_name),
        ))
    }

    async fn reject_login<T>(&self, username: &str, reason: &str, ctx: &RequestContext) -> Result<T> {
        self.audit
            .record(
                NewAuditEvent::new(EventType::Login, USERS, username)
                    .failed()
                    .details(reason)
                    .context(ctx),
            )
            .await;

        tracing::warn!(
            username = %username,
            reason = %reason,
            source_ip = ?ctx.source_ip,
            "Login failed"
        );

        Err(MedgateError::InvalidCredentials)
    }

    /// End a session; the token is refused from now until it expires
    pub async fn logout(&self, claims: &Claims, ctx: &RequestContext) {
        self.revocations.revoke(claims);
        let pruned = self.revocations.prune(Utc::now());
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned expired revocations");
        }

        self.audit
            .record(
                NewAuditEvent::new(EventType::Logout, USERS, &claims.username)
                    .details("User logged out")
                    .context(ctx),
            )
            .await;

        tracing::info!(username = %claims.username, "Logout");
    }

    /// Account details for the bearer of `claims`
    pub async fn current_user(&self, claims: &Claims) -> Result<UserSummary> {
        let user = self.user(claims.user_id).await?;
        let role = self.role_of(&user).await?;
        Ok(UserSummary::new(&user, role.role_name))
    }

    /// Change the caller's own password after checking the current one
    pub async fn change_password(
        &self,
        claims: &Claims,
        current_password: &str,
        new_password: &str,
        ctx: &RequestContext,
    ) -> Result<()> {
        if current_password.is_empty() || new_password.is_empty() {
            return Err(MedgateError::Validation(
                "Current password and new password are required".to_string(),
            ));
        }

        let user = self.user(claims.user_id).await?;
        if !self.hasher.verify(current_password, &user.password_hash) {
            self.audit
                .record(
                    NewAuditEvent::new(EventType::Update, USERS, &claims.username)
                        .failed()
                        .details("Password change rejected - current password incorrect")
                        .context(ctx),
                )
                .await;
            return Err(MedgateError::InvalidCredentials);
        }

        let digest = self.hasher.hash(new_password)?;
        self.storage.update_password(user.user_id, &digest).await?;

        self.audit
            .record(
                NewAuditEvent::new(EventType::Update, USERS, &claims.username)
                    .details("Password changed")
                    .context(ctx),
            )
            .await;

        tracing::info!(username = %claims.username, "Password changed");
        Ok(())
    }

    // ==================== User Management ====================

    /// Create an account with the named role
    pub async fn create_user(
        &self,
        actor: &Actor,
        username: &str,
        password: &str,
        role_name: &str,
        ctx: &RequestContext,
    ) -> Result<UserSummary> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(MedgateError::Validation(
                "Username and password are required".to_string(),
            ));
        }

        let role = self.role_by_name(role_name).await?;
        let new_user = NewUser {
            username: username.to_string(),
            password_hash: self.hasher.hash(password)?,
            role_id: role.role_id,
        };

        let user = match self.storage.insert_user(&new_user).await {
            Ok(user) => user,
            Err(e) => {
                let err = MedgateError::from(e);
                self.audit_failure(actor, EventType::Insert, USERS, &err, ctx).await;
                return Err(err);
            }
        };

        self.audit
            .record(
                NewAuditEvent::new(EventType::Insert, USERS, &actor.username)
                    .details(format!(
                        "Created user {} with role {}",
                        user.username, role.role_name
                    ))
                    .context(ctx),
            )
            .await;

        tracing::info!(
            username = %user.username,
            role = %role.role_name,
            by = %actor.username,
            "User created"
        );

        Ok(UserSummary::new(&user, role.role_name))
    }

    /// Every account, active or not, with its role name
    pub async fn list_users(&self) -> Result<Vec<UserSummary>> {
        let roles: HashMap<_, _> = self
            .storage
            .list_roles()
            .await?
            .into_iter()
            .map(|r| (r.role_id, r.role_name))
            .collect();

        let users = self.storage.list_users().await?;
        Ok(users
            .iter()
            .map(|user| {
                let role_name = roles.get(&user.role_id).cloned().unwrap_or_default();
                UserSummary::new(user, role_name)
            })
            .collect())
    }

    /// Replace a user's role. The change applies to tokens issued afterwards.
    pub async fn assign_role(
        &self,
        actor: &Actor,
        user_id: UserId,
        role_name: &str,
        ctx: &RequestContext,
    ) -> Result<UserSummary> {
        let role = self.role_by_name(role_name).await?;
        let mut user = self.user(user_id).await?;

        self.storage.set_user_role(user_id, role.role_id).await?;

        self.audit
            .record(
                NewAuditEvent::new(EventType::Update, USERS, &actor.username)
                    .details(format!(
                        "Assigned role {} to user {}",
                        role.role_name, user.username
                    ))
                    .context(ctx),
            )
            .await;

        tracing::info!(
            username = %user.username,
            role = %role.role_name,
            by = %actor.username,
            "Role assigned"
        );

        user.role_id = role.role_id;
        Ok(UserSummary::new(&user, role.role_name))
    }

    /// Soft-delete an account. It stays in the store, keeps its role
    /// reference and can no longer log in.
    pub async fn deactivate_user(
        &self,
        actor: &Actor,
        user_id: UserId,
        ctx: &RequestContext,
    ) -> Result<()> {
        if actor.user_id == Some(user_id) {
            return Err(MedgateError::Validation(
                "You cannot deactivate your own account".to_string(),
            ));
        }

        let user = self.user(user_id).await?;
        self.storage.set_user_active(user_id, false).await?;

        self.audit
            .record(
                NewAuditEvent::new(EventType::Delete, USERS, &actor.username)
                    .details(format!("Deactivated user {}", user.username))
                    .context(ctx),
            )
            .await;

        tracing::info!(username = %user.username, by = %actor.username, "User deactivated");
        Ok(())
    }

    // ==================== Role Management ====================

    pub async fn create_role(
        &self,
        actor: &Actor,
        role_name: &str,
        description: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<Role> {
        let role_name = role_name.trim();
        if role_name.is_empty() {
            return Err(MedgateError::Validation("Role name is required".to_string()));
        }

        let role = match self.storage.insert_role(role_name, description).await {
            Ok(role) => role,
            Err(e) => {
                let err = MedgateError::from(e);
                self.audit_failure(actor, EventType::Insert, ROLES, &err, ctx).await;
                return Err(err);
            }
        };

        self.audit
            .record(
                NewAuditEvent::new(EventType::Insert, ROLES, &actor.username)
                    .details(format!("Created role {}", role.role_name))
                    .context(ctx),
            )
            .await;

        tracing::info!(role = %role.role_name, by = %actor.username, "Role created");
        Ok(role)
    }

    /// Every role with the number of accounts assigned to it
    pub async fn list_roles(&self) -> Result<Vec<RoleSummary>> {
        let mut counts: HashMap<_, u64> = HashMap::new();
        for user in self.storage.list_users().await? {
            *counts.entry(user.role_id).or_default() += 1;
        }

        Ok(self
            .storage
            .list_roles()
            .await?
            .into_iter()
            .map(|role| RoleSummary {
                user_count: counts.get(&role.role_id).copied().unwrap_or(0),
                role_id: role.role_id,
                role_name: role.role_name,
                description: role.description,
            })
            .collect())
    }

    /// Delete a role and its grants; refused while any account references it
    pub async fn delete_role(&self, actor: &Actor, role_name: &str, ctx: &RequestContext) -> Result<()> {
        let role = self.role_by_name(role_name).await?;

        if let Err(e) = self.storage.delete_role(role.role_id).await {
            let err = MedgateError::from(e);
            self.audit_failure(actor, EventType::Delete, ROLES, &err, ctx).await;
            return Err(err);
        }

        self.audit
            .record(
                NewAuditEvent::new(EventType::Delete, ROLES, &actor.username)
                    .details(format!("Deleted role {}", role.role_name))
                    .context(ctx),
            )
            .await;

        tracing::info!(role = %role.role_name, by = %actor.username, "Role deleted");
        Ok(())
    }

    // ==================== Helpers ====================

    async fn user(&self, user_id: UserId) -> Result<User> {
        self.storage
            .get_user(user_id)
            .await?
            .ok_or_else(|| MedgateError::NotFound("User not found".to_string()))
    }

    async fn role_by_name(&self, role_name: &str) -> Result<Role> {
        self.storage
            .get_role_by_name(role_name)
            .await?
            .ok_or_else(|| MedgateError::NotFound(format!("Role '{}' not found", role_name)))
    }

    async fn role_of(&self, user: &User) -> Result<Role> {
        self.storage.get_role(user.role_id).await?.ok_or_else(|| {
            MedgateError::Internal(format!(
                "user {} references missing role {}",
                user.user_id, user.role_id
            ))
        })
    }

    async fn audit_failure(
        &self,
        actor: &Actor,
        event_type: EventType,
        resource: &str,
        err: &MedgateError,
        ctx: &RequestContext,
    ) {
        self.audit
            .record(
                NewAuditEvent::new(event_type, resource, &actor.username)
                    .failed()
                    .details(err.to_string())
                    .context(ctx),
            )
            .await;
    }
}
