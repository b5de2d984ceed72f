//! Identity of the signed-in user.
//!
//! A session that carries a `userId` names a user in the
//! [`UserDirectory`]. The request context resolves it once per request
//! into a [`CurrentUser`] whose role, regions and groups load lazily.

pub mod user;

pub use user::{CurrentUser, MemoryDirectory, UserDirectory, UserRecord};

/// Session key holding the signed-in user's id.
pub const USER_ID_KEY: &str = "userId";
