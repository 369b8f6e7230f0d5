use std::collections::HashSet;
use std::sync::Arc;

use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use shellgate_db_entities::{
    PermissionGrant, RolePermission, TeamMember, User, UserRoleAssignment,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use shellgate_common::ShellgateError;

pub const PERM_ADMIN: &str = "admin";
pub const PERM_CONNECTION_LAUNCH: &str = "connection.launch";
pub const PERM_CONNECTION_VIEW: &str = "connection.view";
pub const PERM_SSH_CONNECT: &str = "protocol:ssh.connect";
pub const PERM_SSH_GRANT_WRITE: &str = "protocol:ssh.grant_write";
pub const PERM_SSH_SFTP: &str = "protocol:ssh.sftp";
pub const PERM_SESSION_SHARE: &str = "session.share";
pub const PERM_SESSION_VIEW_ALL: &str = "session.view_all";
pub const PERM_SESSION_VIEW_TEAM: &str = "session.view_team";
pub const PERM_RECORDING_VIEW: &str = "session.recording.view";
pub const PERM_RECORDING_DELETE: &str = "session.recording.delete";
pub const PERM_SNIPPET_MANAGE: &str = "snippet.manage";
pub const PERM_IDENTITY_USE: &str = "identity.use";

/// The closed permission set.
pub const KNOWN_PERMISSIONS: &[&str] = &[
    PERM_ADMIN,
    PERM_CONNECTION_LAUNCH,
    PERM_CONNECTION_VIEW,
    PERM_SSH_CONNECT,
    PERM_SSH_GRANT_WRITE,
    PERM_SSH_SFTP,
    PERM_SESSION_SHARE,
    PERM_SESSION_VIEW_ALL,
    PERM_SESSION_VIEW_TEAM,
    PERM_RECORDING_VIEW,
    PERM_RECORDING_DELETE,
    PERM_SNIPPET_MANAGE,
    PERM_IDENTITY_USE,
];

/// (child, parent): holding the parent satisfies a query for the child.
const DEPENDENCIES: &[(&str, &str)] = &[
    (PERM_CONNECTION_LAUNCH, PERM_ADMIN),
    (PERM_CONNECTION_VIEW, PERM_CONNECTION_LAUNCH),
    (PERM_SSH_CONNECT, PERM_CONNECTION_LAUNCH),
    (PERM_SSH_SFTP, PERM_SSH_CONNECT),
    (PERM_SESSION_SHARE, PERM_ADMIN),
    (PERM_SSH_GRANT_WRITE, PERM_SESSION_SHARE),
    (PERM_SESSION_VIEW_ALL, PERM_ADMIN),
    (PERM_SESSION_VIEW_TEAM, PERM_SESSION_VIEW_ALL),
    (PERM_RECORDING_VIEW, PERM_ADMIN),
    (PERM_RECORDING_DELETE, PERM_ADMIN),
    (PERM_SNIPPET_MANAGE, PERM_ADMIN),
    (PERM_IDENTITY_USE, PERM_ADMIN),
];

/// The requested permission plus every transitive ancestor; a grant for
/// any member of this set satisfies the query.
pub fn satisfying_set(permission: &str) -> HashSet<&'static str> {
    let mut out = HashSet::new();
    let Some(root) = KNOWN_PERMISSIONS.iter().find(|p| **p == permission) else {
        return out;
    };
    let mut queue = vec![*root];
    while let Some(current) = queue.pop() {
        if out.insert(current) {
            for (child, parent) in DEPENDENCIES {
                if *child == current {
                    queue.push(parent);
                }
            }
        }
    }
    out
}

pub fn grant_satisfies(granted: &str, requested: &str) -> bool {
    satisfying_set(requested).contains(granted)
}

/// Evaluates `(user, permission)` and `(user, resource, permission)`
/// predicates. Resolution order: direct user grants, role-mediated
/// grants, team-scoped grants, then resource-level rows.
pub struct PermissionChecker {
    db: Arc<Mutex<DatabaseConnection>>,
}

impl PermissionChecker {
    pub fn new(db: Arc<Mutex<DatabaseConnection>>) -> Self {
        PermissionChecker { db }
    }

    pub async fn is_root(&self, user_id: &Uuid) -> Result<bool, ShellgateError> {
        let db = self.db.lock().await;
        let user = User::Entity::find_by_id(*user_id).one(&*db).await?;
        Ok(user.map(|u| u.is_root).unwrap_or(false))
    }

    pub async fn user_roles(&self, user_id: &Uuid) -> Result<Vec<Uuid>, ShellgateError> {
        let db = self.db.lock().await;
        Ok(UserRoleAssignment::Entity::find()
            .filter(UserRoleAssignment::Column::UserId.eq(*user_id))
            .all(&*db)
            .await?
            .into_iter()
            .map(|a| a.role_id)
            .collect())
    }

    pub async fn team_ids_for_user(&self, user_id: &Uuid) -> Result<Vec<Uuid>, ShellgateError> {
        let db = self.db.lock().await;
        Ok(TeamMember::Entity::find()
            .filter(TeamMember::Column::UserId.eq(*user_id))
            .all(&*db)
            .await?
            .into_iter()
            .map(|m| m.team_id)
            .collect())
    }

    pub async fn is_team_member(
        &self,
        user_id: &Uuid,
        team_id: &Uuid,
    ) -> Result<bool, ShellgateError> {
        Ok(self.team_ids_for_user(user_id).await?.contains(team_id))
    }

    /// Global query: `(user, permission)`.
    pub async fn user_has_permission(
        &self,
        user_id: &Uuid,
        permission: &str,
    ) -> Result<bool, ShellgateError> {
        self.check(user_id, None, permission).await
    }

    /// Resource-scoped query. A global grant also satisfies a
    /// resource-scoped query.
    pub async fn user_has_resource_permission(
        &self,
        user_id: &Uuid,
        resource_type: &str,
        resource_id: &Uuid,
        permission: &str,
    ) -> Result<bool, ShellgateError> {
        self.check(user_id, Some((resource_type, resource_id)), permission)
            .await
    }

    async fn check(
        &self,
        user_id: &Uuid,
        resource: Option<(&str, &Uuid)>,
        permission: &str,
    ) -> Result<bool, ShellgateError> {
        let satisfying = satisfying_set(permission);
        if satisfying.is_empty() {
            return Ok(false);
        }

        if self.is_root(user_id).await? {
            return Ok(true);
        }

        let role_ids = self.user_roles(user_id).await?;
        let team_ids = self.team_ids_for_user(user_id).await?;

        {
            let db = self.db.lock().await;

            if !role_ids.is_empty() {
                let role_grants = RolePermission::Entity::find()
                    .filter(RolePermission::Column::RoleId.is_in(role_ids.clone()))
                    .all(&*db)
                    .await?;
                if role_grants
                    .iter()
                    .any(|g| satisfying.contains(g.permission_id.as_str()))
                {
                    return Ok(true);
                }
            }

            let mut principal_ids = vec![*user_id];
            principal_ids.extend(role_ids.iter().copied());
            principal_ids.extend(team_ids.iter().copied());

            let grants = PermissionGrant::Entity::find()
                .filter(PermissionGrant::Column::PrincipalId.is_in(principal_ids))
                .all(&*db)
                .await?;

            for grant in grants {
                if !satisfying.contains(grant.permission_id.as_str()) {
                    continue;
                }
                match (&grant.resource_type, &grant.resource_id, resource) {
                    // Global grant satisfies everything.
                    (None, _, _) => return Ok(true),
                    (Some(rt), Some(rid), Some((want_rt, want_rid))) => {
                        if rt == want_rt && rid == want_rid {
                            return Ok(true);
                        }
                    }
                    _ => (),
                }
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_of_permission_itself_satisfies() {
        assert!(grant_satisfies(PERM_SSH_CONNECT, PERM_SSH_CONNECT));
    }

    #[test]
    fn ancestor_grant_satisfies_descendant() {
        assert!(grant_satisfies(PERM_CONNECTION_LAUNCH, PERM_SSH_CONNECT));
        assert!(grant_satisfies(PERM_ADMIN, PERM_SSH_SFTP));
        assert!(grant_satisfies(PERM_SESSION_SHARE, PERM_SSH_GRANT_WRITE));
    }

    #[test]
    fn descendant_grant_does_not_satisfy_ancestor() {
        assert!(!grant_satisfies(PERM_SSH_CONNECT, PERM_CONNECTION_LAUNCH));
        assert!(!grant_satisfies(PERM_SSH_SFTP, PERM_ADMIN));
    }

    #[test]
    fn unrelated_grant_does_not_satisfy() {
        assert!(!grant_satisfies(PERM_RECORDING_VIEW, PERM_SSH_CONNECT));
    }

    #[test]
    fn unknown_permission_satisfied_by_nothing() {
        assert!(satisfying_set("does.not.exist").is_empty());
        assert!(!grant_satisfies(PERM_ADMIN, "does.not.exist"));
    }

    #[test]
    fn satisfying_set_is_transitive() {
        let set = satisfying_set(PERM_SSH_SFTP);
        assert!(set.contains(PERM_SSH_SFTP));
        assert!(set.contains(PERM_SSH_CONNECT));
        assert!(set.contains(PERM_CONNECTION_LAUNCH));
        assert!(set.contains(PERM_ADMIN));
        assert!(!set.contains(PERM_SESSION_SHARE));
    }
}
