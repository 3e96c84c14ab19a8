use clap::{Parser, Subcommand};
use sha1::Sha1;
use sha2::Sha256;
use tracing_subscriber::EnvFilter;

use palaver_backend::passwords::{StoredPassword, StoredPasswordArgon2, StoredPasswordScram};
use palaver_backend::settings::Settings;
use palaver_backend::store::{MemoryStoreBackend, StoreHandle};
use palaver_core::xmpp::jid::Jid;

mod server;

#[derive(Parser)]
#[command(name = "palaver", about = "An RFC 6120 XMPP server for local clients")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a user account with all stored password formats.
    AddUser { bare_jid: String, password: String },
    /// Remove a user account.
    RemoveUser { bare_jid: String },
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let settings = Settings::init()?;
    let store = StoreHandle::new(MemoryStoreBackend::default());

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::AddUser { bare_jid, password }) => {
            let bare_jid = bare_jid.parse::<Jid>()?.to_bare();
            let stored_password_argon2 = StoredPasswordArgon2::new(&password)?.to_string();
            let stored_password_scram_sha1 =
                StoredPasswordScram::<Sha1>::new(&password)?.to_string();
            let stored_password_scram_sha256 =
                StoredPasswordScram::<Sha256>::new(&password)?.to_string();
            store
                .add_user(
                    bare_jid,
                    stored_password_argon2,
                    stored_password_scram_sha1,
                    stored_password_scram_sha256,
                )
                .await?;
        }
        Some(Commands::RemoveUser { bare_jid }) => {
            let bare_jid = bare_jid.parse::<Jid>()?.to_bare();
            store.remove_user(bare_jid).await?;
        }
        None => {
            server::run(settings, store).await?;
        }
    }

    Ok(())
}
