use palaver_core::xmpp::error::SaslFailureKind;

use super::{AuthProvider, MechanismResult};

/// RFC 4616 PLAIN: a single `authzid NUL authcid NUL password` message
/// verified against the credential store.
pub(crate) struct PlainSession<A> {
    provider: A,
}

impl<A> PlainSession<A>
where
    A: AuthProvider,
{
    pub fn new(provider: A) -> Self {
        Self { provider }
    }

    pub async fn start(&mut self, initial_response: Option<Vec<u8>>) -> MechanismResult {
        match initial_response {
            Some(payload) => self.verify(payload).await,
            // No initial response: solicit the message with an empty
            // challenge.
            None => MechanismResult::Challenge(Vec::new()),
        }
    }

    pub async fn step(&mut self, response: Vec<u8>) -> MechanismResult {
        self.verify(response).await
    }

    async fn verify(&self, payload: Vec<u8>) -> MechanismResult {
        let parts: Vec<&[u8]> = payload.split(|byte| *byte == 0).collect();
        let &[authzid, authcid, password] = parts.as_slice() else {
            return MechanismResult::Failure(SaslFailureKind::MalformedRequest);
        };

        let (Ok(authzid), Ok(authcid), Ok(password)) = (
            std::str::from_utf8(authzid),
            std::str::from_utf8(authcid),
            std::str::from_utf8(password),
        ) else {
            return MechanismResult::Failure(SaslFailureKind::MalformedRequest);
        };

        if authcid.is_empty() || password.is_empty() {
            return MechanismResult::Failure(SaslFailureKind::MalformedRequest);
        }
        // Acting on behalf of another identity is not supported.
        if !authzid.is_empty() && authzid != authcid {
            return MechanismResult::Failure(SaslFailureKind::NotAuthorized);
        }

        match self.provider.authenticate_plain(authcid, password).await {
            Ok(Some(jid)) => MechanismResult::Success {
                jid,
                additional_data: None,
            },
            Ok(None) => MechanismResult::Failure(SaslFailureKind::NotAuthorized),
            Err(_) => MechanismResult::Failure(SaslFailureKind::TemporaryAuthFailure),
        }
    }
}

#[cfg(test)]
mod tests {
    use base64::prelude::*;

    use crate::sasl::tests_support::FixedProvider;

    use super::*;

    fn session() -> PlainSession<FixedProvider> {
        PlainSession::new(FixedProvider::new("testuser", "password123", "localhost"))
    }

    #[tokio::test]
    async fn valid_credentials_succeed() {
        // The literal payload from RFC 6120's PLAIN example shape:
        // "\0testuser\0password123".
        let payload = BASE64_STANDARD
            .decode("AHRlc3R1c2VyAHBhc3N3b3JkMTIz")
            .unwrap();
        let result = session().start(Some(payload)).await;
        let MechanismResult::Success { jid, .. } = result else {
            panic!("expected success");
        };
        assert_eq!(jid.to_string(), "testuser@localhost");
    }

    #[tokio::test]
    async fn wrong_password_is_not_authorized() {
        let result = session().start(Some(b"\0testuser\0wrong".to_vec())).await;
        assert!(matches!(
            result,
            MechanismResult::Failure(SaslFailureKind::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn unknown_user_is_not_authorized() {
        let result = session()
            .start(Some(b"\0stranger\0password123".to_vec()))
            .await;
        assert!(matches!(
            result,
            MechanismResult::Failure(SaslFailureKind::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn missing_separator_is_malformed() {
        let result = session().start(Some(b"testuser password123".to_vec())).await;
        assert!(matches!(
            result,
            MechanismResult::Failure(SaslFailureKind::MalformedRequest)
        ));
    }

    #[tokio::test]
    async fn empty_password_is_malformed() {
        let result = session().start(Some(b"\0testuser\0".to_vec())).await;
        assert!(matches!(
            result,
            MechanismResult::Failure(SaslFailureKind::MalformedRequest)
        ));
    }

    #[tokio::test]
    async fn extra_nul_is_malformed() {
        let result = session()
            .start(Some(b"\0testuser\0pass\0word".to_vec()))
            .await;
        assert!(matches!(
            result,
            MechanismResult::Failure(SaslFailureKind::MalformedRequest)
        ));
    }

    #[tokio::test]
    async fn foreign_authzid_is_rejected() {
        let result = session()
            .start(Some(b"admin\0testuser\0password123".to_vec()))
            .await;
        assert!(matches!(
            result,
            MechanismResult::Failure(SaslFailureKind::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn matching_authzid_is_accepted() {
        let result = session()
            .start(Some(b"testuser\0testuser\0password123".to_vec()))
            .await;
        assert!(matches!(result, MechanismResult::Success { .. }));
    }

    #[tokio::test]
    async fn absent_initial_response_solicits_empty_challenge() {
        let result = session().start(None).await;
        let MechanismResult::Challenge(challenge) = result else {
            panic!("expected challenge");
        };
        assert!(challenge.is_empty());
    }
}
