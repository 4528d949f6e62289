use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::queries::BranchFilter;
use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Staff,
}

/// Which branches a caller may write to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "branches")]
pub enum BranchAccess {
    All,
    Custom(Vec<Ulid>),
}

/// Identity and branch-access context supplied with every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessContext {
    pub tenant_id: String,
    pub user_id: String,
    pub role: Role,
    pub branch_access: BranchAccess,
}

impl AccessContext {
    /// Full access; used for system-originated events such as payment confirmations.
    pub fn system(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: "system".into(),
            role: Role::Owner,
            branch_access: BranchAccess::All,
        }
    }

    /// Owners and callers with `All` access see every branch.
    pub fn has_full_access(&self) -> bool {
        self.role == Role::Owner || self.branch_access == BranchAccess::All
    }

    pub fn can_access(&self, branch_id: Ulid) -> bool {
        if self.has_full_access() {
            return true;
        }
        matches!(&self.branch_access, BranchAccess::Custom(allowed) if allowed.contains(&branch_id))
    }

    /// Tenant-wide settings and catalog entries are off limits to callers
    /// restricted to some branches.
    pub fn require_full_access(&self) -> Result<(), EngineError> {
        if self.has_full_access() {
            Ok(())
        } else {
            Err(EngineError::AllBranchesRequired)
        }
    }

    pub fn require_access(&self, branch_id: Ulid) -> Result<(), EngineError> {
        if self.can_access(branch_id) {
            Ok(())
        } else {
            Err(EngineError::ForbiddenBranch(branch_id))
        }
    }

    /// Read-path filter matching exactly the branches this caller may see.
    pub fn branch_filter(&self) -> BranchFilter {
        match &self.branch_access {
            BranchAccess::Custom(allowed) if !self.has_full_access() => {
                BranchFilter::AnyOf(allowed.clone())
            }
            _ => BranchFilter::Any,
        }
    }
}

impl Engine {
    /// Pick the branch a write lands in: an explicit request wins, then the
    /// resource's own branch, then the tenant's primary branch. The result must
    /// be inside the caller's access.
    pub(super) fn resolve_branch(
        &self,
        ctx: &AccessContext,
        requested: Option<Ulid>,
        resource_branch: Option<Ulid>,
    ) -> Result<Ulid, EngineError> {
        let branch = match requested.or(resource_branch) {
            Some(id) => {
                if !self.branches.contains_key(&id) {
                    return Err(EngineError::NotFound(id));
                }
                id
            }
            None => self.primary_branch().ok_or(EngineError::NoPrimaryBranch)?,
        };
        ctx.require_access(branch)?;
        Ok(branch)
    }

    /// A resource without a branch of its own belongs to the primary branch.
    pub async fn require_resource_access(
        &self,
        ctx: &AccessContext,
        resource_id: Ulid,
    ) -> Result<(), EngineError> {
        if ctx.has_full_access() {
            return Ok(());
        }
        let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
        let home = rs.read().await.info.branch_id;
        self.require_branch_access(ctx, home)
    }

    /// Access to `branch_id`, or to the primary branch when it is unset.
    pub fn require_branch_access(
        &self,
        ctx: &AccessContext,
        branch_id: Option<Ulid>,
    ) -> Result<(), EngineError> {
        if ctx.has_full_access() {
            return Ok(());
        }
        let branch = match branch_id {
            Some(id) => id,
            None => self.primary_branch().ok_or(EngineError::NoPrimaryBranch)?,
        };
        ctx.require_access(branch)
    }
}
