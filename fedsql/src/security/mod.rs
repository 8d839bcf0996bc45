//! Request security: policy rule expressions, the row/column-level
//! enforcer, and bearer token validation.

pub mod enforcer;
pub mod expr;
pub mod oidc;

pub use enforcer::{apply_cls, apply_rls};
pub use oidc::OidcValidator;
