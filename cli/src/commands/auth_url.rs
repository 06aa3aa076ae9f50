use crate::config::AppConfig;
use anyhow::Result;
use clap::Args;
use tidevault_backends::{OAuthClient, TokenEndpoint};

#[derive(Args)]
pub struct AuthUrlCommand;

impl AuthUrlCommand {
    pub async fn run(&self, config: &AppConfig) -> Result<()> {
        let client = OAuthClient::new(config.oauth_config())?;
        println!("{}", client.authorization_url()?);
        Ok(())
    }
}
