use crate::xml::{namespaces, Element};

/// Conditions that terminate the whole stream (RFC 6120 §4.9.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    BadFormat,
    Conflict,
    ConnectionTimeout,
    HostUnknown,
    InternalServerError,
    InvalidFrom,
    InvalidNamespace,
    NotAuthorized,
    NotWellFormed,
    PolicyViolation,
    RestrictedXml,
    SystemShutdown,
    UnsupportedEncoding,
    UnsupportedStanzaType,
    UnsupportedVersion,
}

impl StreamErrorKind {
    pub fn condition(&self) -> &'static str {
        match self {
            StreamErrorKind::BadFormat => "bad-format",
            StreamErrorKind::Conflict => "conflict",
            StreamErrorKind::ConnectionTimeout => "connection-timeout",
            StreamErrorKind::HostUnknown => "host-unknown",
            StreamErrorKind::InternalServerError => "internal-server-error",
            StreamErrorKind::InvalidFrom => "invalid-from",
            StreamErrorKind::InvalidNamespace => "invalid-namespace",
            StreamErrorKind::NotAuthorized => "not-authorized",
            StreamErrorKind::NotWellFormed => "not-well-formed",
            StreamErrorKind::PolicyViolation => "policy-violation",
            StreamErrorKind::RestrictedXml => "restricted-xml",
            StreamErrorKind::SystemShutdown => "system-shutdown",
            StreamErrorKind::UnsupportedEncoding => "unsupported-encoding",
            StreamErrorKind::UnsupportedStanzaType => "unsupported-stanza-type",
            StreamErrorKind::UnsupportedVersion => "unsupported-version",
        }
    }

    /// Builds the `<stream:error>` element announcing this condition.
    pub fn to_element(&self) -> Element {
        let mut error = Element::new("error", Some(namespaces::XMPP_STREAMS));
        error.with_child(self.condition(), Some(namespaces::XMPP_STREAM_ERRORS), |condition| {
            condition.set_attribute("xmlns", None, namespaces::XMPP_STREAM_ERRORS);
        });
        error
    }
}

impl std::fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.condition())
    }
}

/// Error types attached to stanza errors (RFC 6120 §8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
}

impl StanzaErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaErrorType::Auth => "auth",
            StanzaErrorType::Cancel => "cancel",
            StanzaErrorType::Continue => "continue",
            StanzaErrorType::Modify => "modify",
            StanzaErrorType::Wait => "wait",
        }
    }
}

/// Conditions scoped to a single stanza (RFC 6120 §8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorKind {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    ItemNotFound,
    JidMalformed,
    NotAuthorized,
    PolicyViolation,
    RecipientUnavailable,
    RemoteServerNotFound,
    ServiceUnavailable,
    UndefinedCondition,
    UnexpectedRequest,
}

impl StanzaErrorKind {
    pub fn condition(&self) -> &'static str {
        match self {
            StanzaErrorKind::BadRequest => "bad-request",
            StanzaErrorKind::Conflict => "conflict",
            StanzaErrorKind::FeatureNotImplemented => "feature-not-implemented",
            StanzaErrorKind::Forbidden => "forbidden",
            StanzaErrorKind::ItemNotFound => "item-not-found",
            StanzaErrorKind::JidMalformed => "jid-malformed",
            StanzaErrorKind::NotAuthorized => "not-authorized",
            StanzaErrorKind::PolicyViolation => "policy-violation",
            StanzaErrorKind::RecipientUnavailable => "recipient-unavailable",
            StanzaErrorKind::RemoteServerNotFound => "remote-server-not-found",
            StanzaErrorKind::ServiceUnavailable => "service-unavailable",
            StanzaErrorKind::UndefinedCondition => "undefined-condition",
            StanzaErrorKind::UnexpectedRequest => "unexpected-request",
        }
    }

    /// The error type RFC 6120 associates with each condition.
    pub fn default_type(&self) -> StanzaErrorType {
        match self {
            StanzaErrorKind::BadRequest => StanzaErrorType::Modify,
            StanzaErrorKind::Conflict => StanzaErrorType::Cancel,
            StanzaErrorKind::FeatureNotImplemented => StanzaErrorType::Cancel,
            StanzaErrorKind::Forbidden => StanzaErrorType::Auth,
            StanzaErrorKind::ItemNotFound => StanzaErrorType::Cancel,
            StanzaErrorKind::JidMalformed => StanzaErrorType::Modify,
            StanzaErrorKind::NotAuthorized => StanzaErrorType::Auth,
            StanzaErrorKind::PolicyViolation => StanzaErrorType::Modify,
            StanzaErrorKind::RecipientUnavailable => StanzaErrorType::Wait,
            StanzaErrorKind::RemoteServerNotFound => StanzaErrorType::Cancel,
            StanzaErrorKind::ServiceUnavailable => StanzaErrorType::Cancel,
            StanzaErrorKind::UndefinedCondition => StanzaErrorType::Cancel,
            StanzaErrorKind::UnexpectedRequest => StanzaErrorType::Wait,
        }
    }
}

impl std::fmt::Display for StanzaErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.condition())
    }
}

/// SASL failure conditions (RFC 6120 §6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslFailureKind {
    Aborted,
    InvalidMechanism,
    MalformedRequest,
    MechanismTooWeak,
    NotAuthorized,
    TemporaryAuthFailure,
}

impl SaslFailureKind {
    pub fn condition(&self) -> &'static str {
        match self {
            SaslFailureKind::Aborted => "aborted",
            SaslFailureKind::InvalidMechanism => "invalid-mechanism",
            SaslFailureKind::MalformedRequest => "malformed-request",
            SaslFailureKind::MechanismTooWeak => "mechanism-too-weak",
            SaslFailureKind::NotAuthorized => "not-authorized",
            SaslFailureKind::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }

    pub fn to_element(&self) -> Element {
        let mut failure = Element::new("failure", Some(namespaces::XMPP_SASL));
        failure.set_attribute("xmlns", None, namespaces::XMPP_SASL);
        failure.add_child(Element::new(self.condition(), Some(namespaces::XMPP_SASL)));
        failure
    }
}

impl std::fmt::Display for SaslFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.condition())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_error_element_carries_condition() {
        let element = StreamErrorKind::PolicyViolation.to_element();
        assert!(element.validate("error", Some(namespaces::XMPP_STREAMS)));
        assert!(element
            .find_child("policy-violation", Some(namespaces::XMPP_STREAM_ERRORS))
            .is_some());
    }

    #[test]
    fn default_types_follow_rfc() {
        assert_eq!(
            StanzaErrorKind::FeatureNotImplemented.default_type(),
            StanzaErrorType::Cancel
        );
        assert_eq!(StanzaErrorKind::BadRequest.default_type(), StanzaErrorType::Modify);
        assert_eq!(StanzaErrorKind::Forbidden.default_type(), StanzaErrorType::Auth);
    }

    #[test]
    fn sasl_failure_element() {
        let element = SaslFailureKind::NotAuthorized.to_element();
        assert!(element.validate("failure", Some(namespaces::XMPP_SASL)));
        assert!(element
            .find_child("not-authorized", Some(namespaces::XMPP_SASL))
            .is_some());
    }
}
