//! Authentication and authorization for medgate
//!
//! - Hash and verify staff passwords (bcrypt)
//! - Issue and verify signed session tokens (HS256 JWT)
//! - Gate each request on its route's role allow-list
//! - Manage accounts, roles and logout

mod extract;
mod manager;
mod middleware;
mod password;
mod revocation;
mod token;
mod types;

pub use extract::{CurrentUser, TrustedProxies};
pub use manager::AuthManager;
pub use middleware::{extract_bearer_token, AccessGate};
pub use password::{PasswordHasher, MAX_BCRYPT_COST, MIN_BCRYPT_COST};
pub use revocation::RevocationList;
pub use token::{IssuedToken, TokenService};
pub use types::{
    Claims, LoginToken, NewUser, Role, RoleId, RoleName, RoleSummary, User, UserId, UserSummary,
    BUILTIN_ROLES, ROLE_ADMIN, ROLE_DOCTOR, ROLE_NURSE, ROLE_RECEPTIONIST,
};
