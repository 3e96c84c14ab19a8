use std::collections::HashMap;

use anyhow::Error;

use palaver_core::xmpp::jid::Jid;

use super::{StoreBackend, StoredPasswordKind};

#[derive(Debug, Clone)]
struct UserRecord {
    stored_password_argon2: String,
    stored_password_scram_sha1: String,
    stored_password_scram_sha256: String,
}

/// In-process credential store keyed by bare JID.
#[derive(Debug, Default)]
pub struct MemoryStoreBackend {
    users: HashMap<Jid, UserRecord>,
}

impl StoreBackend for MemoryStoreBackend {
    async fn add_user(
        &mut self,
        jid: Jid,
        stored_password_argon2: String,
        stored_password_scram_sha1: String,
        stored_password_scram_sha256: String,
    ) -> Result<(), Error> {
        self.users.insert(
            jid.to_bare(),
            UserRecord {
                stored_password_argon2,
                stored_password_scram_sha1,
                stored_password_scram_sha256,
            },
        );

        Ok(())
    }

    async fn remove_user(&mut self, jid: Jid) -> Result<(), Error> {
        self.users.remove(&jid.to_bare());

        Ok(())
    }

    async fn get_stored_password(
        &self,
        jid: Jid,
        kind: StoredPasswordKind,
    ) -> Result<Option<String>, Error> {
        let record = self.users.get(&jid.to_bare());
        Ok(record.map(|record| match kind {
            StoredPasswordKind::Argon2 => record.stored_password_argon2.clone(),
            StoredPasswordKind::ScramSha1 => record.stored_password_scram_sha1.clone(),
            StoredPasswordKind::ScramSha256 => record.stored_password_scram_sha256.clone(),
        }))
    }

    async fn set_stored_password(
        &mut self,
        jid: Jid,
        kind: StoredPasswordKind,
        stored_password: String,
    ) -> Result<(), Error> {
        if let Some(record) = self.users.get_mut(&jid.to_bare()) {
            match kind {
                StoredPasswordKind::Argon2 => record.stored_password_argon2 = stored_password,
                StoredPasswordKind::ScramSha1 => {
                    record.stored_password_scram_sha1 = stored_password
                }
                StoredPasswordKind::ScramSha256 => {
                    record.stored_password_scram_sha256 = stored_password
                }
            }
        }

        Ok(())
    }
}
