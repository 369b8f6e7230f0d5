#![allow(non_snake_case)]

pub mod ChatMessage;
pub mod Connection;
pub mod ConnectionSession;
pub mod Identity;
pub mod IdentityShare;
pub mod PermissionGrant;
pub mod RecordingArtifact;
pub mod Role;
pub mod RolePermission;
pub mod Snippet;
pub mod Team;
pub mod TeamMember;
pub mod User;
pub mod UserRoleAssignment;
