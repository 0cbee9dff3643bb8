//! Role-to-permission resolution
//!
//! The grant table is for administration and reporting: request-time checks
//! use the route allow-lists of [`AccessRule`], and [`PermissionResolver::seed_defaults`]
//! keeps the two in step for the built-in roles.

mod rules;
mod types;

pub use rules::{AccessRule, RoleAllowList};
pub use types::{
    Action, Grant, Permission, PermissionId, PermissionMatrix, Resource, ResourceActions,
};

use crate::audit::{AuditRecorder, EventType, NewAuditEvent};
use crate::auth::{Role, BUILTIN_ROLES};
use crate::error::{MedgateError, Result};
use crate::storage::StorageBackend;
use crate::{Actor, RequestContext};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

const ROLE_PERMISSIONS: &str = "role_permissions";

/// What [`PermissionResolver::seed_defaults`] added
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub roles_created: usize,
    pub permissions: usize,
    pub grants_added: usize,
}

/// Reads and edits the role-permission grant table
pub struct PermissionResolver {
    storage: Arc<dyn StorageBackend>,
    audit: Arc<AuditRecorder>,
}

impl PermissionResolver {
    pub fn new(storage: Arc<dyn StorageBackend>, audit: Arc<AuditRecorder>) -> Self {
        Self { storage, audit }
    }

    /// Full role x resource view of the grant table
    pub async fn matrix(&self) -> Result<PermissionMatrix> {
        let roles = self.storage.list_roles().await?;
        let permissions = self.storage.list_permissions().await?;
        let grants = self.storage.list_grants().await?;

        let mut resources: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for p in &permissions {
            resources
                .entry(p.resource_name.clone())
                .or_default()
                .insert(p.action_name.clone());
        }

        let mut matrix: BTreeMap<String, BTreeMap<String, Vec<String>>> = roles
            .iter()
            .map(|role| {
                let empty = resources.keys().map(|r| (r.clone(), Vec::new())).collect();
                (role.role_name.clone(), empty)
            })
            .collect();

        let role_names: HashMap<_, _> = roles.iter().map(|r| (r.role_id, &r.role_name)).collect();
        let by_id: HashMap<_, _> = permissions.iter().map(|p| (p.permission_id, p)).collect();

        for grant in &grants {
            let (Some(role), Some(permission)) =
                (role_names.get(&grant.role_id), by_id.get(&grant.permission_id))
            else {
                continue;
            };
            if let Some(actions) = matrix
                .get_mut(role.as_str())
                .and_then(|m| m.get_mut(&permission.resource_name))
            {
                actions.push(permission.action_name.clone());
            }
        }

        for actions in matrix.values_mut().flat_map(|m| m.values_mut()) {
            actions.sort();
        }

        Ok(PermissionMatrix {
            roles: roles.into_iter().map(|r| r.role_name).collect(),
            resources: resources
                .into_iter()
                .map(|(name, actions)| ResourceActions {
                    name,
                    actions: actions.into_iter().collect(),
                })
                .collect(),
            permissions: matrix,
        })
    }

    /// Permissions granted to one role, ordered by resource then action
    pub async fn permissions_for_role(&self, role_name: &str) -> Result<Vec<Permission>> {
        let role = self.role(role_name).await?;
        let mut permissions = self.storage.role_permissions(role.role_id).await?;
        permissions.sort_by(|a, b| {
            a.resource_name
                .cmp(&b.resource_name)
                .then_with(|| a.action_name.cmp(&b.action_name))
        });
        Ok(permissions)
    }

    /// Grant `action` on `resource` to a role. Granting an existing edge is a
    /// no-op; returns whether a new edge was added.
    pub async fn grant(
        &self,
        actor: &Actor,
        role_name: &str,
        resource: &str,
        action: &str,
        ctx: &RequestContext,
    ) -> Result<bool> {
        let role = self.role(role_name).await?;
        let permission = self.permission(resource, action).await?;

        let added = self
            .storage
            .insert_grant(role.role_id, permission.permission_id)
            .await?;

        let mut details = format!(
            "Granted {} on {} to {}",
            permission.action_name, permission.resource_name, role.role_name
        );
        if !added {
            details.push_str(" (already granted)");
        }
        self.audit
            .record(
                NewAuditEvent::new(EventType::Grant, ROLE_PERMISSIONS, &actor.username)
                    .details(details)
                    .context(ctx),
            )
            .await;

        tracing::info!(
            role = %role.role_name,
            resource = %permission.resource_name,
            action = %permission.action_name,
            added,
            by = %actor.username,
            "Permission granted"
        );

        Ok(added)
    }

    /// Remove `action` on `resource` from a role; `NotFound` when the role
    /// does not hold it
    pub async fn revoke(
        &self,
        actor: &Actor,
        role_name: &str,
        resource: &str,
        action: &str,
        ctx: &RequestContext,
    ) -> Result<()> {
        let role = self.role(role_name).await?;
        let permission = self.permission(resource, action).await?;

        let removed = self
            .storage
            .delete_grant(role.role_id, permission.permission_id)
            .await?;
        if !removed {
            return Err(MedgateError::NotFound(
                "Permission not found for this role".to_string(),
            ));
        }

        self.audit
            .record(
                NewAuditEvent::new(EventType::Revoke, ROLE_PERMISSIONS, &actor.username)
                    .details(format!(
                        "Revoked {} on {} from {}",
                        permission.action_name, permission.resource_name, role.role_name
                    ))
                    .context(ctx),
            )
            .await;

        tracing::info!(
            role = %role.role_name,
            resource = %permission.resource_name,
            action = %permission.action_name,
            by = %actor.username,
            "Permission revoked"
        );

        Ok(())
    }

    /// Create the built-in roles, the resource x action permission universe
    /// and grants matching the route allow-lists. Safe to run repeatedly.
    pub async fn seed_defaults(&self) -> Result<SeedReport> {
        let mut report = SeedReport::default();

        let mut roles: HashMap<&str, Role> = HashMap::new();
        for (name, description) in BUILTIN_ROLES {
            let role = match self.storage.get_role_by_name(name).await? {
                Some(role) => role,
                None => {
                    report.roles_created += 1;
                    self.storage.insert_role(name, Some(description)).await?
                }
            };
            roles.insert(name, role);
        }

        for resource in Resource::ALL {
            for action in Action::ALL {
                let description = format!("{} on {}", action, resource);
                let permission = self
                    .storage
                    .upsert_permission(resource.as_str(), action.as_str(), Some(&description))
                    .await?;
                report.permissions += 1;

                let rule = AccessRule::for_route(resource, action);
                for role_name in rule.roles.builtin_roles() {
                    if let Some(role) = roles.get(role_name) {
                        if self
                            .storage
                            .insert_grant(role.role_id, permission.permission_id)
                            .await?
                        {
                            report.grants_added += 1;
                        }
                    }
                }
            }
        }

        tracing::info!(
            roles_created = report.roles_created,
            permissions = report.permissions,
            grants_added = report.grants_added,
            "Seeded default roles and permissions"
        );

        Ok(report)
    }

    async fn role(&self, role_name: &str) -> Result<Role> {
        self.storage
            .get_role_by_name(role_name)
            .await?
            .ok_or_else(|| MedgateError::NotFound(format!("Role '{}' not found", role_name)))
    }

    async fn permission(&self, resource: &str, action: &str) -> Result<Permission> {
        let resource = resource.trim().to_ascii_lowercase();
        let action = action.trim().to_ascii_uppercase();

        self.storage
            .find_permission(&resource, &action)
            .await?
            .ok_or_else(|| MedgateError::NotFound("Permission not found".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditFilter, PageRequest};
    use crate::auth::{ROLE_ADMIN, ROLE_DOCTOR, ROLE_NURSE, ROLE_RECEPTIONIST};
    use crate::config::AuditConfig;
    use crate::storage::MemoryStorage;

    fn resolver() -> (PermissionResolver, Arc<AuditRecorder>) {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let audit = Arc::new(AuditRecorder::new(storage.clone(), AuditConfig::default()));
        (PermissionResolver::new(storage, audit.clone()), audit)
    }

    fn admin() -> Actor {
        Actor::system("admin")
    }

    #[tokio::test]
    async fn test_seed_defaults_mirrors_allow_lists() {
        let (resolver, _) = resolver();
        let report = resolver.seed_defaults().await.unwrap();
        assert_eq!(report.roles_created, 4);
        assert_eq!(report.permissions, 28);

        let matrix = resolver.matrix().await.unwrap();
        assert_eq!(matrix.roles, vec![ROLE_ADMIN, ROLE_DOCTOR, ROLE_RECEPTIONIST, ROLE_NURSE]);
        assert_eq!(matrix.resources.len(), 7);
        assert!(matrix.allows(ROLE_ADMIN, "audit_log", "DELETE"));
        assert!(matrix.allows(ROLE_DOCTOR, "medical_records", "UPDATE"));
        assert!(matrix.allows(ROLE_NURSE, "patients", "SELECT"));
        assert!(!matrix.allows(ROLE_NURSE, "patients", "INSERT"));
        assert!(matrix.allows(ROLE_RECEPTIONIST, "appointments", "DELETE"));

        // Actions are sorted within each cell
        assert_eq!(
            matrix.permissions[ROLE_ADMIN]["patients"],
            vec!["DELETE", "INSERT", "SELECT", "UPDATE"]
        );

        let again = resolver.seed_defaults().await.unwrap();
        assert_eq!(again.roles_created, 0);
        assert_eq!(again.grants_added, 0);
    }

    #[tokio::test]
    async fn test_matrix_includes_roles_without_grants() {
        let (resolver, _) = resolver();
        resolver.seed_defaults().await.unwrap();
        resolver
            .storage
            .insert_role("Pharmacist", None)
            .await
            .unwrap();

        let matrix = resolver.matrix().await.unwrap();
        let pharmacist = &matrix.permissions["Pharmacist"];
        assert_eq!(pharmacist.len(), 7);
        assert!(pharmacist.values().all(Vec::is_empty));
    }

    #[tokio::test]
    async fn test_grant_is_idempotent() {
        let (resolver, audit) = resolver();
        resolver.seed_defaults().await.unwrap();
        let ctx = RequestContext::new();

        assert!(resolver
            .grant(&admin(), ROLE_NURSE, "appointments", "insert", &ctx)
            .await
            .unwrap());
        assert!(!resolver
            .grant(&admin(), ROLE_NURSE, "appointments", "INSERT", &ctx)
            .await
            .unwrap());

        let granted: Vec<_> = resolver
            .permissions_for_role(ROLE_NURSE)
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.resource_name == "appointments" && p.action_name == "INSERT")
            .collect();
        assert_eq!(granted.len(), 1);

        let page = audit
            .query(&AuditFilter::new().event_type(EventType::Grant), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn test_grant_unknown_permission_or_role() {
        let (resolver, _) = resolver();
        resolver.seed_defaults().await.unwrap();
        let ctx = RequestContext::new();

        let result = resolver
            .grant(&admin(), ROLE_NURSE, "billing", "SELECT", &ctx)
            .await;
        assert!(matches!(result, Err(MedgateError::NotFound(ref m)) if m == "Permission not found"));

        let result = resolver
            .grant(&admin(), "Janitor", "patients", "SELECT", &ctx)
            .await;
        assert!(matches!(result, Err(MedgateError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_revoke_absent_edge_is_not_found() {
        let (resolver, audit) = resolver();
        resolver.seed_defaults().await.unwrap();
        let ctx = RequestContext::new();
        let before = resolver.matrix().await.unwrap();

        let result = resolver
            .revoke(&admin(), ROLE_NURSE, "patients", "DELETE", &ctx)
            .await;
        assert!(matches!(
            result,
            Err(MedgateError::NotFound(ref m)) if m == "Permission not found for this role"
        ));
        assert_eq!(resolver.matrix().await.unwrap(), before);

        resolver
            .revoke(&admin(), ROLE_NURSE, "patients", "SELECT", &ctx)
            .await
            .unwrap();
        assert!(!resolver
            .matrix()
            .await
            .unwrap()
            .allows(ROLE_NURSE, "patients", "SELECT"));

        let page = audit
            .query(&AuditFilter::new().event_type(EventType::Revoke), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }
}
