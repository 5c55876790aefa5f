//! Remote gateway panel.

pub mod xui;

use crate::identity::Identity;
use async_trait::async_trait;

pub use xui::XuiPanel;

/// An identity as the panel sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub identity: Identity,
    pub enabled: bool,
    /// Access credential (client UUID).
    pub credential: String,
}

/// Error from the gateway panel.
#[derive(Debug)]
pub enum PanelError {
    /// HTTP request failed.
    Http(reqwest::Error),
    /// Timeout.
    Timeout,
    /// Login failed or the session was rejected twice.
    Auth(String),
    /// Non-success HTTP status.
    Status { status: u16, body: String },
    /// The panel answered with `success: false`.
    Rejected(String),
    /// Invalid response.
    InvalidResponse(String),
    /// No client with this identity on the inbound.
    NotFound(Identity),
}

impl std::fmt::Display for PanelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PanelError::Http(e) => write!(f, "HTTP error: {}", e),
            PanelError::Timeout => write!(f, "Request timed out"),
            PanelError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            PanelError::Status { status, body } => write!(f, "HTTP {}: {}", status, body),
            PanelError::Rejected(msg) => write!(f, "Panel rejected request: {}", msg),
            PanelError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
            PanelError::NotFound(identity) => write!(f, "Identity not found: {}", identity),
        }
    }
}

impl std::error::Error for PanelError {}

impl From<reqwest::Error> for PanelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PanelError::Timeout
        } else {
            PanelError::Http(e)
        }
    }
}

/// Enable/disable state of remote identities.
#[async_trait]
pub trait GatewayProxy: Send + Sync {
    /// Every identity on the policed inbound.
    async fn list_identities(&self) -> Result<Vec<RemoteIdentity>, PanelError>;

    async fn enable(&self, identity: &Identity) -> Result<(), PanelError>;

    async fn disable(&self, identity: &Identity) -> Result<(), PanelError>;

    /// Disable the identity, mark it exhausted and rotate its credential so
    /// live sessions drop immediately. Returns the new credential.
    ///
    /// Safe to retry in full after any failure.
    async fn aggressive_reset(&self, identity: &Identity) -> Result<String, PanelError>;

    /// Resolve an email (case-insensitive) to the canonical identity.
    async fn find_identity(&self, email: &str) -> Result<Option<RemoteIdentity>, PanelError> {
        Ok(self
            .list_identities()
            .await?
            .into_iter()
            .find(|remote| remote.identity.matches_email(email)))
    }

    /// Whether the identity is currently enabled.
    async fn status(&self, identity: &Identity) -> Result<bool, PanelError> {
        match self.find_identity(identity.as_str()).await? {
            Some(remote) => Ok(remote.enabled),
            None => Err(PanelError::NotFound(identity.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticPanel(Vec<RemoteIdentity>);

    #[async_trait]
    impl GatewayProxy for StaticPanel {
        async fn list_identities(&self) -> Result<Vec<RemoteIdentity>, PanelError> {
            Ok(self.0.clone())
        }

        async fn enable(&self, _identity: &Identity) -> Result<(), PanelError> {
            Ok(())
        }

        async fn disable(&self, _identity: &Identity) -> Result<(), PanelError> {
            Ok(())
        }

        async fn aggressive_reset(&self, _identity: &Identity) -> Result<String, PanelError> {
            Ok("new".to_string())
        }
    }

    fn panel() -> StaticPanel {
        StaticPanel(vec![
            RemoteIdentity {
                identity: Identity::from("Alice@X"),
                enabled: true,
                credential: "a".to_string(),
            },
            RemoteIdentity {
                identity: Identity::from("bob@x"),
                enabled: false,
                credential: "b".to_string(),
            },
        ])
    }

    #[tokio::test]
    async fn test_find_identity_ignores_case() {
        let remote = panel().find_identity("alice@x").await.unwrap().unwrap();
        assert_eq!(remote.identity, Identity::from("Alice@X"));
        assert!(panel().find_identity("carol@x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status() {
        let panel = panel();
        assert!(panel.status(&Identity::from("Alice@X")).await.unwrap());
        assert!(!panel.status(&Identity::from("bob@x")).await.unwrap());
        assert!(matches!(
            panel.status(&Identity::from("carol@x")).await,
            Err(PanelError::NotFound(_))
        ));
    }

    #[test]
    fn test_error_display() {
        let err = PanelError::Status {
            status: 502,
            body: "bad gateway".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 502: bad gateway");
        assert_eq!(
            PanelError::NotFound(Identity::from("a@x")).to_string(),
            "Identity not found: a@x"
        );
    }
}
