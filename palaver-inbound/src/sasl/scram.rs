use std::marker::PhantomData;

use base64::prelude::*;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use palaver_core::xmpp::error::SaslFailureKind;
use palaver_core::xmpp::jid::Jid;

use super::{AuthProvider, Mechanism, MechanismResult};

/// Octets of server-generated nonce entropy; 18 bytes is 144 bits, above
/// the 128-bit floor required for SCRAM nonces.
const SERVER_NONCE_BYTES: usize = 18;

/// Hash-specific pieces of the SCRAM computation (RFC 5802 §3).
pub trait ScramDigest: Send + Sync + 'static {
    const MECHANISM: Mechanism;
    const OUTPUT_LEN: usize;

    fn digest(data: &[u8]) -> Vec<u8>;
    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8>;
    fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8>;
}

impl ScramDigest for Sha1 {
    const MECHANISM: Mechanism = Mechanism::ScramSha1;
    const OUTPUT_LEN: usize = 20;

    fn digest(data: &[u8]) -> Vec<u8> {
        <Sha1 as Digest>::digest(data).to_vec()
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut out = vec![0u8; Self::OUTPUT_LEN];
        pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut out);
        out
    }
}

impl ScramDigest for Sha256 {
    const MECHANISM: Mechanism = Mechanism::ScramSha256;
    const OUTPUT_LEN: usize = 32;

    fn digest(data: &[u8]) -> Vec<u8> {
        <Sha256 as Digest>::digest(data).to_vec()
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut out = vec![0u8; Self::OUTPUT_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
        out
    }
}

enum ScramState {
    Initial,
    AwaitingFinal {
        username: String,
        client_first_bare: String,
        server_first: String,
        combined_nonce: String,
        expected_channel_binding: String,
        stored_key: Vec<u8>,
        server_key: Vec<u8>,
    },
    Done,
}

/// Server side of the RFC 5802 four-flight exchange.
pub(crate) struct ScramSession<A, D> {
    provider: A,
    domain: Jid,
    state: ScramState,
    _digest: PhantomData<D>,
}

impl<A, D> ScramSession<A, D>
where
    A: AuthProvider,
    D: ScramDigest,
{
    pub fn new(provider: A, domain: Jid) -> Self {
        Self {
            provider,
            domain,
            state: ScramState::Initial,
            _digest: PhantomData,
        }
    }

    pub async fn start(&mut self, initial_response: Option<Vec<u8>>) -> MechanismResult {
        match initial_response {
            Some(payload) => self.client_first(payload).await,
            // Client chose not to include an initial response; solicit it.
            None => MechanismResult::Challenge(Vec::new()),
        }
    }

    pub async fn step(&mut self, response: Vec<u8>) -> MechanismResult {
        match std::mem::replace(&mut self.state, ScramState::Done) {
            ScramState::Initial => self.client_first(response).await,
            ScramState::AwaitingFinal {
                username,
                client_first_bare,
                server_first,
                combined_nonce,
                expected_channel_binding,
                stored_key,
                server_key,
            } => self.client_final(
                response,
                &username,
                &client_first_bare,
                &server_first,
                &combined_nonce,
                &expected_channel_binding,
                &stored_key,
                &server_key,
            ),
            ScramState::Done => MechanismResult::Failure(SaslFailureKind::MalformedRequest),
        }
    }

    async fn client_first(&mut self, payload: Vec<u8>) -> MechanismResult {
        let Ok(message) = String::from_utf8(payload) else {
            return MechanismResult::Failure(SaslFailureKind::MalformedRequest);
        };

        // Only the "no channel binding" GS2 flavors are acceptable here;
        // `p=` would demand a binding this server does not implement.
        let (gs2_header, client_first_bare) =
            if let Some(rest) = message.strip_prefix("n,,") {
                ("n,,", rest)
            } else if let Some(rest) = message.strip_prefix("y,,") {
                ("y,,", rest)
            } else {
                return MechanismResult::Failure(SaslFailureKind::MalformedRequest);
            };

        let mut username = None;
        let mut client_nonce = None;
        for part in client_first_bare.split(',') {
            if let Some(value) = part.strip_prefix("n=") {
                username = unescape_username(value);
            } else if let Some(value) = part.strip_prefix("r=") {
                client_nonce = Some(value.to_string());
            } else if part.starts_with("m=") {
                // Mandatory extensions are unsupported.
                return MechanismResult::Failure(SaslFailureKind::MalformedRequest);
            }
        }
        let (Some(username), Some(client_nonce)) = (username, client_nonce) else {
            return MechanismResult::Failure(SaslFailureKind::MalformedRequest);
        };
        if client_nonce.is_empty() || !is_printable(&client_nonce) {
            return MechanismResult::Failure(SaslFailureKind::MalformedRequest);
        }

        let credentials = match self
            .provider
            .scram_credentials(&username, D::MECHANISM)
            .await
        {
            Ok(Some(credentials)) => credentials,
            Ok(None) => return MechanismResult::Failure(SaslFailureKind::NotAuthorized),
            Err(_) => return MechanismResult::Failure(SaslFailureKind::TemporaryAuthFailure),
        };

        let combined_nonce = format!("{client_nonce}{}", generate_nonce());
        let server_first = format!(
            "r={combined_nonce},s={},i={}",
            BASE64_STANDARD.encode(&credentials.salt),
            credentials.iterations
        );

        self.state = ScramState::AwaitingFinal {
            username,
            client_first_bare: client_first_bare.to_string(),
            server_first: server_first.clone(),
            combined_nonce,
            expected_channel_binding: BASE64_STANDARD.encode(gs2_header.as_bytes()),
            stored_key: credentials.stored_key,
            server_key: credentials.server_key,
        };

        MechanismResult::Challenge(server_first.into_bytes())
    }

    #[allow(clippy::too_many_arguments)]
    fn client_final(
        &self,
        payload: Vec<u8>,
        username: &str,
        client_first_bare: &str,
        server_first: &str,
        combined_nonce: &str,
        expected_channel_binding: &str,
        stored_key: &[u8],
        server_key: &[u8],
    ) -> MechanismResult {
        let Ok(message) = String::from_utf8(payload) else {
            return MechanismResult::Failure(SaslFailureKind::MalformedRequest);
        };

        let Some(proof_index) = message.rfind(",p=") else {
            return MechanismResult::Failure(SaslFailureKind::MalformedRequest);
        };
        let client_final_without_proof = &message[..proof_index];
        let proof_base64 = &message[proof_index + 3..];

        let mut channel_binding = None;
        let mut nonce = None;
        for part in client_final_without_proof.split(',') {
            if let Some(value) = part.strip_prefix("c=") {
                channel_binding = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value.to_string());
            }
        }
        let (Some(channel_binding), Some(nonce)) = (channel_binding, nonce) else {
            return MechanismResult::Failure(SaslFailureKind::MalformedRequest);
        };

        if channel_binding != expected_channel_binding {
            return MechanismResult::Failure(SaslFailureKind::MalformedRequest);
        }
        // The nonce must extend the exact client nonce with our addition.
        if nonce != combined_nonce {
            return MechanismResult::Failure(SaslFailureKind::NotAuthorized);
        }

        let Ok(proof) = BASE64_STANDARD.decode(proof_base64) else {
            return MechanismResult::Failure(SaslFailureKind::MalformedRequest);
        };
        if proof.len() != D::OUTPUT_LEN {
            return MechanismResult::Failure(SaslFailureKind::MalformedRequest);
        }

        let auth_message =
            format!("{client_first_bare},{server_first},{client_final_without_proof}");
        let client_signature = D::hmac(stored_key, auth_message.as_bytes());
        let client_key: Vec<u8> = proof
            .iter()
            .zip(client_signature.iter())
            .map(|(p, s)| p ^ s)
            .collect();

        if D::digest(&client_key) != stored_key {
            return MechanismResult::Failure(SaslFailureKind::NotAuthorized);
        }

        let Ok(jid) = Jid::new(Some(username), self.domain.domain(), None) else {
            return MechanismResult::Failure(SaslFailureKind::NotAuthorized);
        };

        let server_signature = D::hmac(server_key, auth_message.as_bytes());
        let additional_data = format!("v={}", BASE64_STANDARD.encode(server_signature));

        MechanismResult::Success {
            jid,
            additional_data: Some(additional_data.into_bytes()),
        }
    }
}

fn generate_nonce() -> String {
    let mut raw = [0u8; SERVER_NONCE_BYTES];
    OsRng.fill_bytes(&mut raw);
    BASE64_STANDARD.encode(raw)
}

fn is_printable(nonce: &str) -> bool {
    nonce
        .chars()
        .all(|c| c.is_ascii_graphic() && c != ',')
}

/// Reverses RFC 5802 username escaping (`=2C` for `,`, `=3D` for `=`).
fn unescape_username(value: &str) -> Option<String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(index) = rest.find('=') {
        out.push_str(&rest[..index]);
        match rest.get(index + 1..index + 3) {
            Some("2C") => out.push(','),
            Some("3D") => out.push('='),
            _ => return None,
        }
        rest = &rest[index + 3..];
    }
    out.push_str(rest);
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}
