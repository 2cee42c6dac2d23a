//! OAuth Manager: authorization-code/PKCE and device-code flows,
//! token storage, and background refresh.

pub mod flows;
pub mod manager;
pub mod refresher;
pub mod storage;
pub mod types;

pub use manager::OAuthManager;
pub use refresher::OAuthRefresher;
pub use storage::OAuthStore;
pub use types::{
    AuthStyle, OAuthMethod, OAuthSession, OAuthToken, ProviderOAuthConfig, SessionStatus,
};
