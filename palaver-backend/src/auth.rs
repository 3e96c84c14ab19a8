use std::future::Future;

use anyhow::{anyhow, Error};
use sha1::Sha1;
use sha2::Sha256;

use palaver_core::xmpp::jid::Jid;
use palaver_inbound::sasl::{AuthProvider, Mechanism, ScramCredentials};

use crate::passwords::{StoredPasswordArgon2, StoredPasswordScram};
use crate::store::{StoreHandle, StoredPasswordKind};

/// Adapts the credential store to the SASL auth provider interface for one
/// served domain.
#[derive(Debug, Clone)]
pub struct StoreAuthProvider {
    store: StoreHandle,
    domain: Jid,
}

impl StoreAuthProvider {
    pub fn new(store: StoreHandle, domain: Jid) -> Self {
        Self { store, domain }
    }

    fn account_jid(&self, username: &str) -> Option<Jid> {
        Jid::new(Some(username), self.domain.domain(), None).ok()
    }
}

impl AuthProvider for StoreAuthProvider {
    fn authenticate_plain(
        &self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<Option<Jid>, Error>> + Send {
        let store = self.store.clone();
        let jid = self.account_jid(username);
        let password = password.to_string();

        async move {
            let Some(jid) = jid else {
                return Ok(None);
            };
            let Some(stored) = store
                .get_stored_password(jid.clone(), StoredPasswordKind::Argon2)
                .await?
            else {
                return Ok(None);
            };
            let stored: StoredPasswordArgon2 = stored
                .parse()
                .map_err(|_| anyhow!("corrupt stored password for {jid}"))?;

            Ok(stored.verify(&password).then_some(jid))
        }
    }

    fn scram_credentials(
        &self,
        username: &str,
        mechanism: Mechanism,
    ) -> impl Future<Output = Result<Option<ScramCredentials>, Error>> + Send {
        let store = self.store.clone();
        let jid = self.account_jid(username);

        async move {
            let Some(jid) = jid else {
                return Ok(None);
            };
            match mechanism {
                Mechanism::Plain => Ok(None),
                Mechanism::ScramSha1 => {
                    let Some(stored) = store
                        .get_stored_password(jid.clone(), StoredPasswordKind::ScramSha1)
                        .await?
                    else {
                        return Ok(None);
                    };
                    let stored: StoredPasswordScram<Sha1> = stored
                        .parse()
                        .map_err(|_| anyhow!("corrupt stored password for {jid}"))?;
                    Ok(Some(stored.credentials()))
                }
                Mechanism::ScramSha256 => {
                    let Some(stored) = store
                        .get_stored_password(jid.clone(), StoredPasswordKind::ScramSha256)
                        .await?
                    else {
                        return Ok(None);
                    };
                    let stored: StoredPasswordScram<Sha256> = stored
                        .parse()
                        .map_err(|_| anyhow!("corrupt stored password for {jid}"))?;
                    Ok(Some(stored.credentials()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::passwords::StoredPassword;
    use crate::store::MemoryStoreBackend;

    use super::*;

    async fn provider_with_user(username: &str, password: &str) -> StoreAuthProvider {
        let store = StoreHandle::new(MemoryStoreBackend::default());
        let domain: Jid = "localhost".parse().unwrap();
        let jid = Jid::new(Some(username), domain.domain(), None).unwrap();
        store
            .add_user(
                jid,
                StoredPasswordArgon2::new(password).unwrap().to_string(),
                StoredPasswordScram::<Sha1>::new(password).unwrap().to_string(),
                StoredPasswordScram::<Sha256>::new(password).unwrap().to_string(),
            )
            .await
            .unwrap();
        StoreAuthProvider::new(store, domain)
    }

    #[tokio::test]
    async fn plain_authentication_succeeds_for_known_user() {
        let provider = provider_with_user("testuser", "password123").await;
        let jid = provider
            .authenticate_plain("testuser", "password123")
            .await
            .unwrap();
        assert_eq!(jid.unwrap().to_string(), "testuser@localhost");
    }

    #[tokio::test]
    async fn plain_authentication_rejects_wrong_password() {
        let provider = provider_with_user("testuser", "password123").await;
        let jid = provider
            .authenticate_plain("testuser", "nope")
            .await
            .unwrap();
        assert!(jid.is_none());
    }

    #[tokio::test]
    async fn plain_authentication_rejects_unknown_user() {
        let provider = provider_with_user("testuser", "password123").await;
        let jid = provider
            .authenticate_plain("stranger", "password123")
            .await
            .unwrap();
        assert!(jid.is_none());
    }

    #[tokio::test]
    async fn scram_credentials_are_returned_per_mechanism() {
        let provider = provider_with_user("testuser", "password123").await;
        let sha1 = provider
            .scram_credentials("testuser", Mechanism::ScramSha1)
            .await
            .unwrap()
            .unwrap();
        let sha256 = provider
            .scram_credentials("testuser", Mechanism::ScramSha256)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sha1.stored_key.len(), 20);
        assert_eq!(sha256.stored_key.len(), 32);
        assert_eq!(sha1.iterations, 4096);
    }

    #[tokio::test]
    async fn scram_credentials_absent_for_unknown_user() {
        let provider = provider_with_user("testuser", "password123").await;
        let credentials = provider
            .scram_credentials("stranger", Mechanism::ScramSha1)
            .await
            .unwrap();
        assert!(credentials.is_none());
    }
}
