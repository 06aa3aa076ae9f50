pub mod chunked;
pub mod credentials;
pub mod oauth;
pub mod retry;

pub use chunked::{ChunkedUploader, GraphTransport, UploadConfig, UploadTransport};
pub use credentials::{
    AccessTokenSource, AuthEvent, Credential, CredentialManager, CredentialStore, JsonCredentialStore,
    MemoryCredentialStore, TokenEndpoint,
};
pub use oauth::{OAuthClient, OAuthConfig};
pub use retry::{retry_with_backoff, RetryConfig, Retryable};
