use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tr_auth::{
    AuthClient, AuthConfig, AuthSession, EnvSecretProvider, FileTokenStore, MinecraftProfile,
};

/// Microsoft account sign-in for the Tritium launcher
#[derive(Debug, Parser)]
#[command(name = "tritium", version, about)]
pub struct Cli {
    /// Azure application (client) id
    #[arg(long, env = "TRITIUM_CLIENT_ID", global = true)]
    client_id: Option<String>,

    /// Override the token storage directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in with a device code (Ctrl-C cancels)
    Login,
    /// Show the signed-in profile
    Status,
    /// Print a valid Minecraft access token
    Token,
    /// Force a token refresh
    Refresh,
    /// Delete stored tokens
    Logout,
    /// Re-encrypt stored tokens under a new key
    RotateKey,
    /// Resolve a player name to its UUID and textures
    Lookup { name: String },
}

impl Cli {
    pub async fn execute(self) -> anyhow::Result<()> {
        match &self.command {
            Command::Login => self.login().await,
            Command::Status => self.status().await,
            Command::Token => {
                let token = self.session().await?.ensure_valid_access_token().await?;
                println!("{}", token);
                Ok(())
            }
            Command::Refresh => {
                self.session().await?.refresh().await?;
                println!("Token refreshed");
                Ok(())
            }
            Command::Logout => {
                self.session().await?.sign_out().await;
                println!("Signed out");
                Ok(())
            }
            Command::RotateKey => {
                self.open_store().await?.rotate_key().await?;
                println!("Token store key rotated");
                Ok(())
            }
            Command::Lookup { name } => self.lookup(name).await,
        }
    }

    async fn login(&self) -> anyhow::Result<()> {
        let session = self.session().await?;

        let cancel = CancellationToken::new();
        let on_ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_ctrl_c.cancel();
            }
        });

        let profile = session
            .sign_in(cancel, |challenge| {
                println!(
                    "To sign in, open {} and enter the code {}",
                    challenge.verification_uri, challenge.user_code
                );
            })
            .await?;

        match profile {
            Some(profile) => print_profile(&profile),
            None => println!("Signed in, but this account does not own Minecraft"),
        }
        Ok(())
    }

    async fn status(&self) -> anyhow::Result<()> {
        match self.session().await?.resume().await? {
            Some(profile) => print_profile(&profile),
            None => println!("Signed out"),
        }
        Ok(())
    }

    async fn lookup(&self, name: &str) -> anyhow::Result<()> {
        // public endpoints, no client id needed
        let client = AuthClient::new(AuthConfig::new(self.client_id.clone().unwrap_or_default()))?;

        let Some(player) = client.lookup_uuid(name).await? else {
            println!("No player named {}", name);
            return Ok(());
        };
        println!("{} {}", player.name, player.id);

        if let Some(textures) = client.fetch_textures(&player.id).await? {
            if let Some(skin) = textures.textures.skin {
                let model = skin.metadata.map(|m| m.model).unwrap_or_else(|| "classic".to_string());
                println!("skin ({}): {}", model, skin.url);
            }
            if let Some(cape) = textures.textures.cape {
                println!("cape: {}", cape.url);
            }
        }
        Ok(())
    }

    fn client(&self) -> anyhow::Result<AuthClient> {
        let client_id = self
            .client_id
            .clone()
            .context("No client id, set TRITIUM_CLIENT_ID or pass --client-id")?;
        Ok(AuthClient::new(AuthConfig::new(client_id))?)
    }

    async fn open_store(&self) -> anyhow::Result<FileTokenStore> {
        let secret = EnvSecretProvider::from_env()?;
        let dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => FileTokenStore::default_storage_dir()?,
        };

        FileTokenStore::open(&dir, &secret)
            .await
            .with_context(|| format!("Failed to open token store at {}", dir.display()))
    }

    async fn session(&self) -> anyhow::Result<AuthSession> {
        let store = self.open_store().await?;
        Ok(AuthSession::new(self.client()?, Arc::new(store)))
    }
}

fn print_profile(profile: &MinecraftProfile) {
    println!("{} ({})", profile.name, profile.id);
    if let Some(skin) = profile.active_skin() {
        println!("skin ({}): {}", skin.variant.to_lowercase(), skin.url);
    }
    if let Some(cape) = profile.active_cape() {
        println!("cape: {}", cape.alias.as_deref().unwrap_or(&cape.id));
    }
}
