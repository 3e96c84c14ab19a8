use crate::xml::{namespaces, Element};
use crate::xmpp::error::{StanzaErrorKind, StanzaErrorType};
use crate::xmpp::jid::Jid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    Normal,
    Chat,
    Groupchat,
    Headline,
    Error,
}

impl MessageType {
    /// Unknown values fall back to `normal` (RFC 6121 §5.2.2).
    fn from_attribute(value: Option<&str>) -> Self {
        match value {
            Some("chat") => MessageType::Chat,
            Some("groupchat") => MessageType::Groupchat,
            Some("headline") => MessageType::Headline,
            Some("error") => MessageType::Error,
            _ => MessageType::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceType {
    #[default]
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    fn from_attribute(value: Option<&str>) -> Result<Self, StanzaParseErrorKind> {
        match value {
            None => Ok(PresenceType::Available),
            Some("unavailable") => Ok(PresenceType::Unavailable),
            Some("subscribe") => Ok(PresenceType::Subscribe),
            Some("subscribed") => Ok(PresenceType::Subscribed),
            Some("unsubscribe") => Ok(PresenceType::Unsubscribe),
            Some("unsubscribed") => Ok(PresenceType::Unsubscribed),
            Some("probe") => Ok(PresenceType::Probe),
            Some("error") => Ok(PresenceType::Error),
            Some(other) => Err(StanzaParseErrorKind::InvalidType(other.to_string())),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, PresenceType::Available)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    fn from_attribute(value: Option<&str>) -> Result<Self, StanzaParseErrorKind> {
        match value {
            Some("get") => Ok(IqType::Get),
            Some("set") => Ok(IqType::Set),
            Some("result") => Ok(IqType::Result),
            Some("error") => Ok(IqType::Error),
            Some(other) => Err(StanzaParseErrorKind::InvalidType(other.to_string())),
            None => Err(StanzaParseErrorKind::InvalidType(String::new())),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Show {
    Away,
    Chat,
    Dnd,
    Xa,
}

impl Show {
    fn from_text(value: &str) -> Option<Self> {
        match value {
            "away" => Some(Show::Away),
            "chat" => Some(Show::Chat),
            "dnd" => Some(Show::Dnd),
            "xa" => Some(Show::Xa),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: Option<String>,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub message_type: MessageType,
    pub body: Option<String>,
    pub subject: Option<String>,
    pub thread: Option<String>,
    element: Element,
}

#[derive(Debug, Clone)]
pub struct Presence {
    pub id: Option<String>,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub presence_type: PresenceType,
    pub show: Option<Show>,
    pub status: Option<String>,
    pub priority: i8,
    element: Element,
}

#[derive(Debug, Clone)]
pub struct Iq {
    pub id: String,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub iq_type: IqType,
    pub query_namespace: Option<String>,
    element: Element,
}

impl Iq {
    pub fn query_payload(&self) -> Option<&Element> {
        self.element.first_child_element()
    }
}

/// A top-level stream element, validated and immutable after parse. The
/// original element tree is carried along so the router can forward stanzas
/// without re-synthesizing them.
#[derive(Debug, Clone)]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
}

#[derive(Debug, thiserror::Error)]
pub enum StanzaParseErrorKind {
    #[error("element `{0}` is not a stanza")]
    NotAStanza(String),
    #[error("attribute `{0}` does not carry a valid JID")]
    MalformedJid(&'static str),
    #[error("iq stanza is missing an id")]
    MissingId,
    #[error("invalid stanza type `{0}`")]
    InvalidType(String),
    #[error("iq of type get or set requires exactly one payload element")]
    MissingPayload,
}

impl StanzaParseErrorKind {
    /// The stanza error condition to report, or `None` when the element is
    /// no stanza at all (a stream-level problem).
    pub fn stanza_error(&self) -> Option<StanzaErrorKind> {
        match self {
            StanzaParseErrorKind::NotAStanza(_) => None,
            StanzaParseErrorKind::MalformedJid(_) => Some(StanzaErrorKind::JidMalformed),
            StanzaParseErrorKind::MissingId
            | StanzaParseErrorKind::InvalidType(_)
            | StanzaParseErrorKind::MissingPayload => Some(StanzaErrorKind::BadRequest),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct StanzaParseError {
    pub kind: StanzaParseErrorKind,
    /// The offending element, returned so the caller can build an error
    /// reply echoing its attributes.
    pub element: Element,
}

impl Stanza {
    pub fn parse(element: Element) -> Result<Self, StanzaParseError> {
        match parse_inner(&element) {
            Ok(builder) => Ok(builder.finish(element)),
            Err(kind) => Err(StanzaParseError { kind, element }),
        }
    }

    pub fn element(&self) -> &Element {
        match self {
            Stanza::Message(message) => &message.element,
            Stanza::Presence(presence) => &presence.element,
            Stanza::Iq(iq) => &iq.element,
        }
    }

    pub fn into_element(self) -> Element {
        match self {
            Stanza::Message(message) => message.element,
            Stanza::Presence(presence) => presence.element,
            Stanza::Iq(iq) => iq.element,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Message(message) => message.id.as_deref(),
            Stanza::Presence(presence) => presence.id.as_deref(),
            Stanza::Iq(iq) => Some(&iq.id),
        }
    }

    pub fn from(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(message) => message.from.as_ref(),
            Stanza::Presence(presence) => presence.from.as_ref(),
            Stanza::Iq(iq) => iq.from.as_ref(),
        }
    }

    pub fn to(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(message) => message.to.as_ref(),
            Stanza::Presence(presence) => presence.to.as_ref(),
            Stanza::Iq(iq) => iq.to.as_ref(),
        }
    }

    /// Stamps the sender address onto the stanza, overwriting any prior one.
    pub fn set_from(&mut self, jid: &Jid) {
        match self {
            Stanza::Message(message) => {
                message.element.set_attribute("from", None, jid.to_string());
                message.from = Some(jid.clone());
            }
            Stanza::Presence(presence) => {
                presence.element.set_attribute("from", None, jid.to_string());
                presence.from = Some(jid.clone());
            }
            Stanza::Iq(iq) => {
                iq.element.set_attribute("from", None, jid.to_string());
                iq.from = Some(jid.clone());
            }
        }
    }

    /// Builds an error reply for this stanza using the condition's default
    /// error type.
    pub fn error_reply(&self, kind: StanzaErrorKind, from: Option<&Jid>) -> Element {
        stanza_error_reply(self.element(), kind.default_type(), kind, from)
    }
}

enum StanzaBuilder {
    Message {
        id: Option<String>,
        from: Option<Jid>,
        to: Option<Jid>,
        message_type: MessageType,
        body: Option<String>,
        subject: Option<String>,
        thread: Option<String>,
    },
    Presence {
        id: Option<String>,
        from: Option<Jid>,
        to: Option<Jid>,
        presence_type: PresenceType,
        show: Option<Show>,
        status: Option<String>,
        priority: i8,
    },
    Iq {
        id: String,
        from: Option<Jid>,
        to: Option<Jid>,
        iq_type: IqType,
        query_namespace: Option<String>,
    },
}

impl StanzaBuilder {
    fn finish(self, element: Element) -> Stanza {
        match self {
            StanzaBuilder::Message {
                id,
                from,
                to,
                message_type,
                body,
                subject,
                thread,
            } => Stanza::Message(Message {
                id,
                from,
                to,
                message_type,
                body,
                subject,
                thread,
                element,
            }),
            StanzaBuilder::Presence {
                id,
                from,
                to,
                presence_type,
                show,
                status,
                priority,
            } => Stanza::Presence(Presence {
                id,
                from,
                to,
                presence_type,
                show,
                status,
                priority,
                element,
            }),
            StanzaBuilder::Iq {
                id,
                from,
                to,
                iq_type,
                query_namespace,
            } => Stanza::Iq(Iq {
                id,
                from,
                to,
                iq_type,
                query_namespace,
                element,
            }),
        }
    }
}

fn parse_inner(element: &Element) -> Result<StanzaBuilder, StanzaParseErrorKind> {
    match element.namespace() {
        None | Some(namespaces::XMPP_CLIENT) => {}
        Some(_) => return Err(StanzaParseErrorKind::NotAStanza(element.name().to_string())),
    }

    let id = element.attribute("id", None).map(|s| s.to_string());
    let from = parse_jid_attribute(element, "from")?;
    let to = parse_jid_attribute(element, "to")?;
    let type_attribute = element.attribute("type", None);

    match element.name() {
        "message" => Ok(StanzaBuilder::Message {
            id,
            from,
            to,
            message_type: MessageType::from_attribute(type_attribute),
            body: child_text(element, "body"),
            subject: child_text(element, "subject"),
            thread: child_text(element, "thread"),
        }),
        "presence" => Ok(StanzaBuilder::Presence {
            id,
            from,
            to,
            presence_type: PresenceType::from_attribute(type_attribute)?,
            show: child_text(element, "show").and_then(|s| Show::from_text(&s)),
            status: child_text(element, "status"),
            priority: parse_priority(element),
        }),
        "iq" => {
            let id = match id {
                Some(id) if !id.is_empty() => id,
                _ => return Err(StanzaParseErrorKind::MissingId),
            };
            let iq_type = IqType::from_attribute(type_attribute)?;
            let payload = element.first_child_element();
            if iq_type.is_request() && payload.is_none() {
                return Err(StanzaParseErrorKind::MissingPayload);
            }
            Ok(StanzaBuilder::Iq {
                id,
                from,
                to,
                iq_type,
                query_namespace: payload.and_then(|p| p.namespace().map(|ns| ns.to_string())),
            })
        }
        other => Err(StanzaParseErrorKind::NotAStanza(other.to_string())),
    }
}

fn parse_jid_attribute(
    element: &Element,
    name: &'static str,
) -> Result<Option<Jid>, StanzaParseErrorKind> {
    match element.attribute(name, None) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| StanzaParseErrorKind::MalformedJid(name)),
        None => Ok(None),
    }
}

/// Looks up a direct child in the stanza content namespace; elements built
/// locally carry no namespace, parsed ones inherit `jabber:client`.
fn find_stanza_child<'e>(element: &'e Element, name: &str) -> Option<&'e Element> {
    element
        .find_child(name, Some(namespaces::XMPP_CLIENT))
        .or_else(|| element.find_child(name, None))
}

fn child_text(element: &Element, name: &str) -> Option<String> {
    find_stanza_child(element, name).map(|child| child.text())
}

/// Values outside [-128, 127] and unparseable values coerce to 0.
fn parse_priority(element: &Element) -> i8 {
    match find_stanza_child(element, "priority") {
        Some(child) => match child.text().trim().parse::<i64>() {
            Ok(value) if (-128..=127).contains(&value) => value as i8,
            _ => 0,
        },
        None => 0,
    }
}

/// Builds an error reply echoing the original's `id` and swapping `from` and
/// `to`. When the original carried no `to`, `fallback_from` (typically the
/// server JID) is stamped as the reply's sender.
pub fn stanza_error_reply(
    original: &Element,
    error_type: StanzaErrorType,
    kind: StanzaErrorKind,
    fallback_from: Option<&Jid>,
) -> Element {
    let mut reply = Element::new(original.name(), None);
    reply.set_attribute("type", None, "error");
    if let Some(id) = original.attribute("id", None) {
        reply.set_attribute("id", None, id);
    }
    if let Some(original_from) = original.attribute("from", None) {
        reply.set_attribute("to", None, original_from);
    }
    match original.attribute("to", None) {
        Some(original_to) => reply.set_attribute("from", None, original_to),
        None => {
            if let Some(from) = fallback_from {
                reply.set_attribute("from", None, from.to_string());
            }
        }
    }

    let mut error = Element::new("error", None);
    error.set_attribute("type", None, error_type.as_str());
    error.with_child(kind.condition(), Some(namespaces::XMPP_STANZA_ERRORS), |condition| {
        condition.set_attribute("xmlns", None, namespaces::XMPP_STANZA_ERRORS);
    });
    reply.add_child(error);

    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(name: &str) -> Element {
        Element::new(name, Some(namespaces::XMPP_CLIENT))
    }

    #[test]
    fn parse_chat_message() {
        let mut message = element("message");
        message.set_attribute("to", None, "bob@localhost");
        message.set_attribute("type", None, "chat");
        message.with_child("body", Some(namespaces::XMPP_CLIENT), |body| {
            body.add_text("hi");
        });

        let Ok(Stanza::Message(message)) = Stanza::parse(message) else {
            panic!("expected message");
        };
        assert_eq!(message.message_type, MessageType::Chat);
        assert_eq!(message.to.unwrap().to_string(), "bob@localhost");
        assert_eq!(message.body.as_deref(), Some("hi"));
    }

    #[test]
    fn unknown_message_type_falls_back_to_normal() {
        let mut message = element("message");
        message.set_attribute("type", None, "carrier-pigeon");
        let Ok(Stanza::Message(message)) = Stanza::parse(message) else {
            panic!("expected message");
        };
        assert_eq!(message.message_type, MessageType::Normal);
    }

    #[test]
    fn presence_without_type_is_available() {
        let Ok(Stanza::Presence(presence)) = Stanza::parse(element("presence")) else {
            panic!("expected presence");
        };
        assert!(presence.presence_type.is_available());
        assert_eq!(presence.priority, 0);
    }

    #[test]
    fn presence_show_and_priority() {
        let mut presence = element("presence");
        presence.with_child("show", Some(namespaces::XMPP_CLIENT), |show| {
            show.add_text("dnd");
        });
        presence.with_child("priority", Some(namespaces::XMPP_CLIENT), |priority| {
            priority.add_text("10");
        });
        let Ok(Stanza::Presence(presence)) = Stanza::parse(presence) else {
            panic!("expected presence");
        };
        assert_eq!(presence.show, Some(Show::Dnd));
        assert_eq!(presence.priority, 10);
    }

    #[test]
    fn presence_priority_out_of_range_coerces_to_zero() {
        for raw in ["300", "-300", "junk"] {
            let mut presence = element("presence");
            presence.with_child("priority", Some(namespaces::XMPP_CLIENT), |priority| {
                priority.add_text(raw);
            });
            let Ok(Stanza::Presence(presence)) = Stanza::parse(presence) else {
                panic!("expected presence");
            };
            assert_eq!(presence.priority, 0, "priority {raw}");
        }
    }

    #[test]
    fn iq_requires_id() {
        let mut iq = element("iq");
        iq.set_attribute("type", None, "get");
        iq.add_child(Element::new("ping", Some(namespaces::PING)));
        let err = Stanza::parse(iq).unwrap_err();
        assert!(matches!(err.kind, StanzaParseErrorKind::MissingId));
        assert_eq!(err.kind.stanza_error(), Some(StanzaErrorKind::BadRequest));
    }

    #[test]
    fn iq_requires_valid_type() {
        let mut iq = element("iq");
        iq.set_attribute("id", None, "x");
        iq.set_attribute("type", None, "fetch");
        let err = Stanza::parse(iq).unwrap_err();
        assert!(matches!(err.kind, StanzaParseErrorKind::InvalidType(_)));
    }

    #[test]
    fn iq_get_requires_payload() {
        let mut iq = element("iq");
        iq.set_attribute("id", None, "x");
        iq.set_attribute("type", None, "get");
        let err = Stanza::parse(iq).unwrap_err();
        assert!(matches!(err.kind, StanzaParseErrorKind::MissingPayload));
    }

    #[test]
    fn iq_result_payload_is_optional() {
        let mut iq = element("iq");
        iq.set_attribute("id", None, "x");
        iq.set_attribute("type", None, "result");
        assert!(Stanza::parse(iq).is_ok());
    }

    #[test]
    fn iq_query_namespace_is_extracted() {
        let mut iq = element("iq");
        iq.set_attribute("id", None, "x");
        iq.set_attribute("type", None, "get");
        iq.add_child(Element::new("ping", Some(namespaces::PING)));
        let Ok(Stanza::Iq(iq)) = Stanza::parse(iq) else {
            panic!("expected iq");
        };
        assert_eq!(iq.query_namespace.as_deref(), Some(namespaces::PING));
    }

    #[test]
    fn malformed_from_is_rejected() {
        let mut message = element("message");
        message.set_attribute("from", None, "@localhost");
        let err = Stanza::parse(message).unwrap_err();
        assert_eq!(err.kind.stanza_error(), Some(StanzaErrorKind::JidMalformed));
    }

    #[test]
    fn unknown_element_is_not_a_stanza() {
        let err = Stanza::parse(element("handshake")).unwrap_err();
        assert!(matches!(err.kind, StanzaParseErrorKind::NotAStanza(_)));
        assert!(err.kind.stanza_error().is_none());
    }

    #[test]
    fn set_from_stamps_attribute_and_field() {
        let jid: Jid = "alice@localhost/tablet".parse().unwrap();
        let mut stanza = Stanza::parse(element("message")).unwrap();
        stanza.set_from(&jid);
        assert_eq!(stanza.from(), Some(&jid));
        assert_eq!(
            stanza.element().attribute("from", None),
            Some("alice@localhost/tablet")
        );
    }

    #[test]
    fn error_reply_swaps_addresses_and_echoes_id() {
        let mut iq = element("iq");
        iq.set_attribute("id", None, "q1");
        iq.set_attribute("type", None, "get");
        iq.set_attribute("from", None, "alice@localhost/tablet");
        iq.set_attribute("to", None, "bob@localhost");
        iq.add_child(Element::new("ping", Some(namespaces::PING)));
        let stanza = Stanza::parse(iq).unwrap();

        let reply = stanza.error_reply(StanzaErrorKind::ServiceUnavailable, None);
        assert_eq!(reply.attribute("id", None), Some("q1"));
        assert_eq!(reply.attribute("type", None), Some("error"));
        assert_eq!(reply.attribute("to", None), Some("alice@localhost/tablet"));
        assert_eq!(reply.attribute("from", None), Some("bob@localhost"));
        let error = reply.find_child("error", None).unwrap();
        assert_eq!(error.attribute("type", None), Some("cancel"));
        assert!(error
            .find_child("service-unavailable", Some(namespaces::XMPP_STANZA_ERRORS))
            .is_some());
    }

    #[test]
    fn error_reply_uses_fallback_from_for_server_directed_stanzas() {
        let server: Jid = "localhost".parse().unwrap();
        let mut iq = element("iq");
        iq.set_attribute("id", None, "q2");
        iq.set_attribute("type", None, "get");
        iq.add_child(Element::new("unknown", Some("urn:example")));
        let stanza = Stanza::parse(iq).unwrap();

        let reply = stanza.error_reply(StanzaErrorKind::FeatureNotImplemented, Some(&server));
        assert_eq!(reply.attribute("from", None), Some("localhost"));
        assert_eq!(reply.attribute("to", None), None);
    }
}
