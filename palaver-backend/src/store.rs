use std::future::Future;

use anyhow::Error;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tracing::warn;

use palaver_core::xmpp::jid::Jid;

pub use self::memory::MemoryStoreBackend;

mod memory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredPasswordKind {
    Argon2,
    ScramSha1,
    ScramSha256,
}

enum Query {
    GetStoredPassword {
        jid: Jid,
        kind: StoredPasswordKind,
        result_tx: oneshot::Sender<Result<Option<String>, Error>>,
    },
}

enum Command {
    AddUser {
        jid: Jid,
        stored_password_argon2: String,
        stored_password_scram_sha1: String,
        stored_password_scram_sha256: String,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    RemoveUser {
        jid: Jid,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    SetStoredPassword {
        jid: Jid,
        kind: StoredPasswordKind,
        stored_password: String,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
}

/// The store runs as its own task; handles talk to it over channels so any
/// number of connections can query concurrently.
struct Store<B>
where
    B: StoreBackend,
{
    queries: mpsc::Receiver<Query>,
    commands: mpsc::Receiver<Command>,
    backend: B,
}

impl<B> Store<B>
where
    B: StoreBackend,
{
    async fn run(&mut self) {
        loop {
            select! {
                Some(query) = self.queries.recv() => {
                    self.handle_query(query).await;
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
                else => break,
            }
        }
    }

    async fn handle_query(&mut self, query: Query) {
        match query {
            Query::GetStoredPassword {
                jid,
                kind,
                result_tx,
            } => {
                let result = self.backend.get_stored_password(jid, kind).await;
                if result_tx.send(result).is_err() {
                    warn!("store query result dropped");
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddUser {
                jid,
                stored_password_argon2,
                stored_password_scram_sha1,
                stored_password_scram_sha256,
                result_tx,
            } => {
                let result = self
                    .backend
                    .add_user(
                        jid,
                        stored_password_argon2,
                        stored_password_scram_sha1,
                        stored_password_scram_sha256,
                    )
                    .await;
                if result_tx.send(result).is_err() {
                    warn!("store command result dropped");
                }
            }
            Command::RemoveUser { jid, result_tx } => {
                let result = self.backend.remove_user(jid).await;
                if result_tx.send(result).is_err() {
                    warn!("store command result dropped");
                }
            }
            Command::SetStoredPassword {
                jid,
                kind,
                stored_password,
                result_tx,
            } => {
                let result = self
                    .backend
                    .set_stored_password(jid, kind, stored_password)
                    .await;
                if result_tx.send(result).is_err() {
                    warn!("store command result dropped");
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreHandle {
    queries: mpsc::Sender<Query>,
    commands: mpsc::Sender<Command>,
}

impl StoreHandle {
    pub fn new<B>(backend: B) -> Self
    where
        B: StoreBackend + Send + 'static,
    {
        let (queries_tx, queries_rx) = mpsc::channel(8);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let mut store = Store {
            queries: queries_rx,
            commands: commands_rx,
            backend,
        };
        tokio::spawn(async move {
            store.run().await;
        });

        StoreHandle {
            queries: queries_tx,
            commands: commands_tx,
        }
    }

    pub async fn add_user(
        &self,
        jid: Jid,
        stored_password_argon2: String,
        stored_password_scram_sha1: String,
        stored_password_scram_sha256: String,
    ) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let msg = Command::AddUser {
            jid,
            stored_password_argon2,
            stored_password_scram_sha1,
            stored_password_scram_sha256,
            result_tx,
        };

        let _ = self.commands.send(msg).await;
        result_rx.await.expect("store is gone")
    }

    pub async fn remove_user(&self, jid: Jid) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let msg = Command::RemoveUser { jid, result_tx };

        let _ = self.commands.send(msg).await;
        result_rx.await.expect("store is gone")
    }

    pub async fn get_stored_password(
        &self,
        jid: Jid,
        kind: StoredPasswordKind,
    ) -> Result<Option<String>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let msg = Query::GetStoredPassword {
            jid,
            kind,
            result_tx,
        };

        let _ = self.queries.send(msg).await;
        result_rx.await.expect("store is gone")
    }

    pub async fn set_stored_password(
        &self,
        jid: Jid,
        kind: StoredPasswordKind,
        stored_password: String,
    ) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let msg = Command::SetStoredPassword {
            jid,
            kind,
            stored_password,
            result_tx,
        };

        let _ = self.commands.send(msg).await;
        result_rx.await.expect("store is gone")
    }
}

pub trait StoreBackend {
    fn add_user(
        &mut self,
        jid: Jid,
        stored_password_argon2: String,
        stored_password_scram_sha1: String,
        stored_password_scram_sha256: String,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn remove_user(&mut self, jid: Jid) -> impl Future<Output = Result<(), Error>> + Send;

    fn get_stored_password(
        &self,
        jid: Jid,
        kind: StoredPasswordKind,
    ) -> impl Future<Output = Result<Option<String>, Error>> + Send;

    fn set_stored_password(
        &mut self,
        jid: Jid,
        kind: StoredPasswordKind,
        stored_password: String,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}
