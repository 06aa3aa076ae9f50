pub mod auth_url;
pub mod backup;
pub mod restore;
pub mod run;

use crate::config::AppConfig;
use anyhow::Result;
use std::sync::Arc;
use tidevault_backends::{
    AuthEvent, ChunkedUploader, CredentialManager, GraphTransport, JsonCredentialStore, OAuthClient,
};
use tidevault_core::{BackupJob, BufferPool, JsonRecordStore};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub fn credential_manager(config: &AppConfig) -> Result<Arc<CredentialManager>> {
    let endpoint = Arc::new(OAuthClient::new(config.oauth_config())?);
    let store = Arc::new(JsonCredentialStore::new(config.credentials_path()));
    Ok(Arc::new(CredentialManager::new(endpoint, store)))
}

pub fn backup_job(config: &AppConfig, force_full: bool, credentials: Option<Arc<CredentialManager>>) -> Result<BackupJob> {
    let ledger = Arc::new(JsonRecordStore::new(config.ledger_dir()));
    let pool = Arc::new(BufferPool::default());
    let job = BackupJob::new(config.backup_config(force_full)?, ledger, pool);

    Ok(match credentials {
        Some(tokens) => {
            let transport = Arc::new(GraphTransport::new(config.api_base())?);
            let uploader = ChunkedUploader::new(transport, tokens, config.upload_config());
            job.with_uploader(Arc::new(uploader))
        }
        None => job,
    })
}

/// Interprets one line typed by the operator: `refresh`, a bare code, or the
/// full redirect URL containing `code=`.
pub fn parse_auth_input(line: &str) -> Option<AuthEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.eq_ignore_ascii_case("refresh") {
        return Some(AuthEvent::Refresh);
    }

    let code = match line.find("code=") {
        Some(pos) => line[pos + "code=".len()..].split('&').next().unwrap_or_default(),
        None => line,
    };
    (!code.is_empty()).then(|| AuthEvent::NewCode(code.to_string()))
}

/// Feeds auth events typed on stdin into a channel, the same way a callback
/// listener would.
///
/// Reads on a plain thread so a pending read never holds up process exit.
pub fn stdin_auth_events() -> mpsc::Receiver<AuthEvent> {
    let (tx, rx) = mpsc::channel(8);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            let Some(event) = parse_auth_input(&line) else {
                continue;
            };
            debug!(?event, "Auth input received");
            if tx.blocking_send(event).is_err() {
                break;
            }
        }
    });
    info!("Paste an authorization code (or the redirect URL) or type 'refresh' at any time");
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth_input() {
        assert_eq!(parse_auth_input("  "), None);
        assert_eq!(parse_auth_input("Refresh"), Some(AuthEvent::Refresh));
        assert_eq!(
            parse_auth_input("M.C507_abc\n"),
            Some(AuthEvent::NewCode("M.C507_abc".to_string()))
        );
        assert_eq!(
            parse_auth_input("http://localhost:8080/callback?code=xyz&state=1"),
            Some(AuthEvent::NewCode("xyz".to_string()))
        );
        assert_eq!(parse_auth_input("http://localhost/callback?code="), None);
    }
}
