use anyhow::{bail, Error};
use tokio::io::ReadHalf;
use tracing::debug;

use palaver_core::xml::stream_parser::StreamParser;
use palaver_core::xml::{namespaces, Element};
use palaver_core::xmpp::error::StanzaErrorKind;
use palaver_core::xmpp::jid::Jid;
use palaver_core::xmpp::stanza::stanza_error_reply;
use palaver_core::xmpp::stream::{Connection, XmppStream};
use palaver_services::registry::{ConnectionId, ResourceRegistry, SessionHandle};

pub(crate) struct ResourceBindingNegotiator {
    _private: (),
}

impl ResourceBindingNegotiator {
    pub fn advertise_feature() -> Element {
        let mut bind = Element::new("bind", Some(namespaces::XMPP_BIND));
        bind.set_attribute("xmlns", None, namespaces::XMPP_BIND);
        bind
    }

    /// The `<session/>` feature is advertised as optional; establishment is
    /// a no-op kept for RFC 3921 era clients.
    pub fn advertise_session_feature() -> Element {
        let mut session = Element::new("session", Some(namespaces::XMPP_SESSION));
        session.set_attribute("xmlns", None, namespaces::XMPP_SESSION);
        session.add_child(Element::new("optional", Some(namespaces::XMPP_SESSION)));
        session
    }

    /// Handles the bind IQ. Returns the bound full JID, or `None` when the
    /// request was answered with a stanza error instead.
    pub async fn negotiate_feature<C, P>(
        stream: &mut XmppStream<C, P>,
        element: &Element,
        authenticated: &Jid,
        registry: &ResourceRegistry,
        connection_id: ConnectionId,
        handle: SessionHandle,
    ) -> Result<Option<Jid>, Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        if element.name() != "iq" {
            bail!("expected IQ stanza");
        }
        if element.attribute("type", None) != Some("set") {
            bail!("bind IQ must be of type set");
        }
        let Some(request_id) = element.attribute("id", None) else {
            bail!("bind IQ does not carry an id");
        };
        let Some(bind_request) = element.find_child("bind", Some(namespaces::XMPP_BIND)) else {
            bail!("IQ does not contain a bind request");
        };

        let requested_resource = bind_request
            .find_child("resource", Some(namespaces::XMPP_BIND))
            .map(|resource| resource.text())
            .filter(|resource| !resource.is_empty());

        let outcome = match registry.bind(
            &authenticated.to_bare(),
            requested_resource.as_deref(),
            connection_id,
            handle,
        ) {
            Ok(outcome) => outcome,
            Err(error) => {
                debug!(%error, "bind request rejected");
                let reply = stanza_error_reply(
                    element,
                    StanzaErrorKind::BadRequest.default_type(),
                    StanzaErrorKind::BadRequest,
                    None,
                );
                stream.writer().write_xml_element(&reply).await?;
                return Ok(None);
            }
        };

        let mut reply = Element::new("iq", None);
        reply.set_attribute("id", None, request_id);
        reply.set_attribute("type", None, "result");
        reply.with_child("bind", Some(namespaces::XMPP_BIND), |bind| {
            bind.set_attribute("xmlns", None, namespaces::XMPP_BIND);
            bind.with_child("jid", Some(namespaces::XMPP_BIND), |jid| {
                jid.add_text(outcome.full_jid.to_string());
            });
        });
        stream.writer().write_xml_element(&reply).await?;

        Ok(Some(outcome.full_jid))
    }
}
