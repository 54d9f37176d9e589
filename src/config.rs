//! Gateway configuration loaded from environment variables.

use serde::{Deserialize, Serialize};

/// Configuration for one mailbox source feeding the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Identifier of the mailbox/source; scopes the correlation namespace.
    pub source_id: i64,

    /// When true, the Thread-Index header contributes a correlation key.
    pub use_thread_index: bool,

    /// Folder for successfully processed mail. None = delete (POP sources
    /// have only INBOX).
    pub accepted_folder: Option<String>,

    /// Folder for refused mail (duplicates, unparseable messages).
    /// None = delete.
    pub refused_folder: Option<String>,

    /// sqlx connection URL of the correlation store.
    pub store_url: String,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let source_id = std::env::var("MAILGATE_SOURCE_ID")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let use_thread_index = std::env::var("MAILGATE_USE_THREAD_INDEX")
            .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
            .unwrap_or(false);
        let accepted_folder = std::env::var("MAILGATE_ACCEPTED_FOLDER").ok();
        let refused_folder = std::env::var("MAILGATE_REFUSED_FOLDER").ok();
        let store_url = std::env::var("MAILGATE_STORE_URL")
            .unwrap_or_else(|_| "sqlite://mailgate.db?mode=rwc".into());

        Self {
            source_id,
            use_thread_index,
            accepted_folder,
            refused_folder,
            store_url,
        }
    }

    /// Configured folder name for a disposition target.
    pub fn folder_name(&self, folder: crate::models::Folder) -> Option<&str> {
        match folder {
            crate::models::Folder::Accepted => self.accepted_folder.as_deref(),
            crate::models::Folder::Refused => self.refused_folder.as_deref(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            source_id: 0,
            use_thread_index: false,
            accepted_folder: Some("accepted".into()),
            refused_folder: Some("refused".into()),
            store_url: "sqlite::memory:".into(),
        }
    }
}
