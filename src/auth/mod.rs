//! Authentication Module
//! Mission: Stateless JWT access with server-side revocation

pub mod api;
pub mod clock;
pub mod deadline;
pub mod gateway;
pub mod jwt;
pub mod middleware;
pub mod models;
pub mod password;
pub mod redis_sessions;
pub mod session_cache;
pub mod sqlite_sessions;
pub mod user_store;

pub use clock::{Clock, SystemClock};
pub use gateway::AuthGateway;
pub use jwt::{SigningKeys, TokenService, TokenSettings};
pub use middleware::{extract_principal, require_auth};
pub use models::{AuthenticatedPrincipal, Principal, Role, TokenPair, TokenType, TokenVerdict};
pub use password::PasswordHasher;
pub use redis_sessions::RedisSessionCache;
pub use session_cache::{InMemorySessionCache, Redemption, SessionCache};
pub use sqlite_sessions::SqliteSessionCache;
pub use user_store::{CredentialStore, SqliteCredentialStore};
