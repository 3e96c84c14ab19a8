use std::fmt::Display;
use std::future::Future;

use anyhow::{bail, Error};
use base64::prelude::*;
use sha1::Sha1;
use sha2::Sha256;
use tokio::io::ReadHalf;
use tracing::debug;

use palaver_core::xml::stream_parser::{Frame, StreamParser};
use palaver_core::xml::{namespaces, Element};
use palaver_core::xmpp::error::SaslFailureKind;
use palaver_core::xmpp::jid::Jid;
use palaver_core::xmpp::stream::{Connection, XmppStream};

use self::plain::PlainSession;
use self::scram::ScramSession;

mod plain;
pub mod scram;

/// Salted credentials stored for one SCRAM mechanism, in RFC 5802 terms.
#[derive(Debug, Clone)]
pub struct ScramCredentials {
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

/// The credential store consumed during authentication.
///
/// Implementations must be cheap to clone and safe for concurrent calls;
/// lookups run on connection tasks.
pub trait AuthProvider: Clone + Send + Sync + 'static {
    /// Verifies a PLAIN username/password pair, yielding the authenticated
    /// bare JID on success.
    fn authenticate_plain(
        &self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<Option<Jid>, Error>> + Send;

    /// Looks up the stored SCRAM credentials for a user.
    fn scram_credentials(
        &self,
        username: &str,
        mechanism: Mechanism,
    ) -> impl Future<Output = Result<Option<ScramCredentials>, Error>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    ScramSha1,
    ScramSha256,
}

#[derive(thiserror::Error, Debug)]
pub enum SaslError {
    #[error("the SASL mechanism `{0}` is not supported")]
    UnsupportedMechanism(String),
}

impl Mechanism {
    /// PLAIN exposes the password and is only offered on protected
    /// transports; SCRAM is always acceptable.
    fn available(&self, secure: bool, tls_enabled: bool) -> bool {
        match self {
            Mechanism::Plain => secure || !tls_enabled,
            Mechanism::ScramSha1 => true,
            Mechanism::ScramSha256 => true,
        }
    }

    fn session<A>(&self, provider: A, domain: Jid) -> MechanismSession<A>
    where
        A: AuthProvider,
    {
        match self {
            Mechanism::Plain => MechanismSession::Plain(PlainSession::new(provider)),
            Mechanism::ScramSha1 => {
                MechanismSession::ScramSha1(ScramSession::new(provider, domain))
            }
            Mechanism::ScramSha256 => {
                MechanismSession::ScramSha256(ScramSession::new(provider, domain))
            }
        }
    }
}

impl TryFrom<&str> for Mechanism {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "PLAIN" => Ok(Mechanism::Plain),
            "SCRAM-SHA-1" => Ok(Mechanism::ScramSha1),
            "SCRAM-SHA-256" => Ok(Mechanism::ScramSha256),
            _ => bail!(SaslError::UnsupportedMechanism(value.into())),
        }
    }
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mechanism::Plain => write!(f, "PLAIN"),
            Mechanism::ScramSha1 => write!(f, "SCRAM-SHA-1"),
            Mechanism::ScramSha256 => write!(f, "SCRAM-SHA-256"),
        }
    }
}

impl From<Mechanism> for Element {
    fn from(mechanism: Mechanism) -> Self {
        let mut element = Element::new("mechanism", Some(namespaces::XMPP_SASL));
        element.add_text(mechanism.to_string());

        element
    }
}

/// One step's outcome inside a mechanism.
pub(crate) enum MechanismResult {
    Challenge(Vec<u8>),
    Success {
        jid: Jid,
        additional_data: Option<Vec<u8>>,
    },
    Failure(SaslFailureKind),
}

enum MechanismSession<A> {
    Plain(PlainSession<A>),
    ScramSha1(ScramSession<A, Sha1>),
    ScramSha256(ScramSession<A, Sha256>),
}

impl<A> MechanismSession<A>
where
    A: AuthProvider,
{
    async fn start(&mut self, initial_response: Option<Vec<u8>>) -> MechanismResult {
        match self {
            MechanismSession::Plain(session) => session.start(initial_response).await,
            MechanismSession::ScramSha1(session) => session.start(initial_response).await,
            MechanismSession::ScramSha256(session) => session.start(initial_response).await,
        }
    }

    async fn step(&mut self, response: Vec<u8>) -> MechanismResult {
        match self {
            MechanismSession::Plain(session) => session.step(response).await,
            MechanismSession::ScramSha1(session) => session.step(response).await,
            MechanismSession::ScramSha256(session) => session.step(response).await,
        }
    }
}

/// How one `<auth/>` exchange ended.
pub(crate) enum SaslOutcome {
    Authenticated(Jid),
    Failed,
}

pub(crate) struct SaslNegotiator {
    _private: (),
}

impl SaslNegotiator {
    pub fn advertise_feature(
        mechanisms: &[Mechanism],
        secure: bool,
        tls_enabled: bool,
    ) -> Element {
        let mut element = Element::new("mechanisms", Some(namespaces::XMPP_SASL));
        element.set_attribute("xmlns", None, namespaces::XMPP_SASL);
        for mechanism in mechanisms {
            if mechanism.available(secure, tls_enabled) {
                element.add_child((*mechanism).into());
            }
        }

        element
    }

    /// Drives a single `<auth/>` exchange to `<success/>` or `<failure/>`.
    /// Protocol-level problems (broken stream, unexpected elements) surface
    /// as errors; authentication failures are part of the normal outcome.
    pub async fn negotiate_feature<C, P, A>(
        stream: &mut XmppStream<C, P>,
        element: &Element,
        provider: &A,
        domain: &Jid,
        mechanisms: &[Mechanism],
        tls_enabled: bool,
    ) -> Result<SaslOutcome, Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
        A: AuthProvider,
    {
        if !element.validate("auth", Some(namespaces::XMPP_SASL)) {
            bail!("expected auth element");
        }

        let secure = stream.is_secure();
        let requested = element.attribute("mechanism", None).unwrap_or_default();
        let mechanism = match Mechanism::try_from(requested) {
            Ok(mechanism)
                if mechanisms.contains(&mechanism)
                    && mechanism.available(secure, tls_enabled) =>
            {
                mechanism
            }
            _ => {
                debug!(mechanism = requested, "rejecting unavailable mechanism");
                return Self::fail(stream, SaslFailureKind::InvalidMechanism).await;
            }
        };

        let mut session = mechanism.session(provider.clone(), domain.clone());
        let initial_response = match decode_payload(&element.text()) {
            Ok(payload) => payload,
            Err(_) => return Self::fail(stream, SaslFailureKind::MalformedRequest).await,
        };

        let mut result = session.start(initial_response).await;
        loop {
            match result {
                MechanismResult::Challenge(challenge) => {
                    let mut xml = Element::new("challenge", Some(namespaces::XMPP_SASL));
                    xml.set_attribute("xmlns", None, namespaces::XMPP_SASL);
                    xml.add_text(BASE64_STANDARD.encode(challenge));
                    stream.writer().write_xml_element(&xml).await?;
                }
                MechanismResult::Success {
                    jid,
                    additional_data,
                } => {
                    let mut xml = Element::new("success", Some(namespaces::XMPP_SASL));
                    xml.set_attribute("xmlns", None, namespaces::XMPP_SASL);
                    if let Some(additional_data) = additional_data {
                        xml.add_text(BASE64_STANDARD.encode(additional_data));
                    }
                    stream.writer().write_xml_element(&xml).await?;
                    return Ok(SaslOutcome::Authenticated(jid));
                }
                MechanismResult::Failure(kind) => {
                    stream.writer().write_xml_element(&kind.to_element()).await?;
                    return Ok(SaslOutcome::Failed);
                }
            }

            let Some(Frame::XmlFragment(response)) = stream.reader().read_frame().await? else {
                bail!("stream ended during SASL negotiation");
            };

            if response.validate("response", Some(namespaces::XMPP_SASL)) {
                let payload = match decode_payload(&response.text()) {
                    Ok(payload) => payload.unwrap_or_default(),
                    Err(_) => {
                        return Self::fail(stream, SaslFailureKind::MalformedRequest).await
                    }
                };
                result = session.step(payload).await;
            } else if response.validate("abort", Some(namespaces::XMPP_SASL)) {
                return Self::fail(stream, SaslFailureKind::Aborted).await;
            } else {
                bail!("unexpected element during SASL negotiation");
            }
        }
    }

    async fn fail<C, P>(
        stream: &mut XmppStream<C, P>,
        kind: SaslFailureKind,
    ) -> Result<SaslOutcome, Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        stream.writer().write_xml_element(&kind.to_element()).await?;
        Ok(SaslOutcome::Failed)
    }
}

/// SASL payloads are base64; a lone `=` denotes an explicitly empty
/// response, absence of text means no initial response at all.
fn decode_payload(text: &str) -> Result<Option<Vec<u8>>, base64::DecodeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed == "=" {
        return Ok(Some(Vec::new()));
    }
    BASE64_STANDARD.decode(trimmed).map(Some)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mechanism_names_round_trip() {
        for name in ["PLAIN", "SCRAM-SHA-1", "SCRAM-SHA-256"] {
            let mechanism = Mechanism::try_from(name).unwrap();
            assert_eq!(mechanism.to_string(), name);
        }
        assert!(Mechanism::try_from("DIGEST-MD5").is_err());
    }

    #[test]
    fn plain_is_gated_on_transport_security() {
        assert!(!Mechanism::Plain.available(false, true));
        assert!(Mechanism::Plain.available(true, true));
        assert!(Mechanism::Plain.available(false, false));
        assert!(Mechanism::ScramSha1.available(false, true));
    }

    #[test]
    fn advertised_mechanisms_respect_gating() {
        let mechanisms = [Mechanism::Plain, Mechanism::ScramSha1, Mechanism::ScramSha256];
        let element = SaslNegotiator::advertise_feature(&mechanisms, false, true);
        assert!(element.validate("mechanisms", Some(namespaces::XMPP_SASL)));
        let advertised: Vec<String> = element
            .child_elements()
            .map(|mechanism| mechanism.text())
            .collect();
        assert_eq!(advertised, vec!["SCRAM-SHA-1", "SCRAM-SHA-256"]);
    }

    #[test]
    fn payload_decoding_handles_empty_forms() {
        assert_eq!(decode_payload("").unwrap(), None);
        assert_eq!(decode_payload("=").unwrap(), Some(Vec::new()));
        assert_eq!(decode_payload("aGk=").unwrap(), Some(b"hi".to_vec()));
        assert!(decode_payload("!!!").is_err());
    }
}
