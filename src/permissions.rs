use tracing::warn;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ViewAttachments,
    UploadAttachments,
    DeleteAttachments,
}

pub fn role_allows(role: &str, permission: Permission) -> bool {
    match role.trim().to_ascii_lowercase().as_str() {
        "admin" | "manager" => true,
        "agent" => matches!(
            permission,
            Permission::ViewAttachments | Permission::UploadAttachments
        ),
        "viewer" => permission == Permission::ViewAttachments,
        _ => false,
    }
}

pub fn ensure_permission(user: &AuthenticatedUser, permission: Permission) -> AppResult<()> {
    if role_allows(&user.role, permission) {
        return Ok(());
    }
    warn!(
        username = %user.username,
        role = %user.role,
        ?permission,
        "permission denied"
    );
    Err(AppError::forbidden())
}
