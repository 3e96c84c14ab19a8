use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use palaver_core::xml::{namespaces, Element};
use palaver_core::xmpp::error::{StanzaErrorKind, StreamErrorKind};
use palaver_core::xmpp::jid::Jid;
use palaver_core::xmpp::stanza::{Iq, IqType, Stanza};

use crate::registry::{ConnectionId, ResourceRegistry, SessionControl, SessionHandle};

/// Software identity reported by `jabber:iq:version` and disco#info.
const SERVER_NAME: &str = "palaver";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The bound session a stanza arrived from.
#[derive(Debug, Clone)]
pub struct RouteSource {
    pub full_jid: Jid,
    pub connection_id: ConnectionId,
}

/// What the connection should do after handing a stanza to the router.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Nothing to write back; the stanza was delivered or dropped.
    Done,
    /// Write this element back to the sender.
    Reply(Element),
    /// The stanza was unacceptable at stream level; close with this error.
    Fail(StreamErrorKind),
}

/// Routes stanzas between locally connected sessions and answers
/// server-directed IQs. Shared across connections; delivery to a peer is a
/// `try_send` into that peer's mailbox so a slow receiver can never stall
/// the sender.
pub struct Router {
    registry: Arc<ResourceRegistry>,
    domain: Jid,
    virtual_hosts: Vec<Jid>,
}

impl Router {
    pub fn new(registry: Arc<ResourceRegistry>, domain: Jid, virtual_hosts: Vec<Jid>) -> Self {
        Self {
            registry,
            domain,
            virtual_hosts,
        }
    }

    pub fn domain(&self) -> &Jid {
        &self.domain
    }

    pub fn is_local_domain(&self, jid: &Jid) -> bool {
        let bare = jid.to_bare();
        if bare.local().is_some() || bare.resource().is_some() {
            return false;
        }
        bare == self.domain || self.virtual_hosts.contains(&bare)
    }

    /// Handles one stanza from a bound session.
    pub fn route(&self, source: &RouteSource, mut stanza: Stanza) -> RouteOutcome {
        // Stamp or verify the sender address.
        match stanza.from() {
            None => stanza.set_from(&source.full_jid),
            Some(from) => {
                let bare = source.full_jid.to_bare();
                if *from != source.full_jid && *from != bare {
                    debug!(claimed = %from, actual = %source.full_jid, "from mismatch");
                    return match &stanza {
                        Stanza::Iq(_) => RouteOutcome::Fail(StreamErrorKind::InvalidFrom),
                        _ => RouteOutcome::Reply(
                            stanza.error_reply(StanzaErrorKind::Forbidden, Some(&self.domain)),
                        ),
                    };
                }
            }
        }

        match stanza.to().cloned() {
            None => self.route_to_server(source, stanza),
            Some(to) if self.is_local_domain(&to) => self.route_to_server(source, stanza),
            Some(to) if to.resource().is_some() => self.route_to_full(stanza, &to),
            Some(to) => self.route_to_bare(stanza, &to),
        }
    }

    /// Stanzas addressed to the server itself (or carrying no address).
    fn route_to_server(&self, source: &RouteSource, stanza: Stanza) -> RouteOutcome {
        match &stanza {
            Stanza::Presence(presence) => {
                // Initial/updated presence of the session itself.
                if presence.to.is_none() {
                    self.registry.update_presence(
                        &source.full_jid,
                        presence.presence_type.is_available(),
                        presence.priority,
                    );
                }
                RouteOutcome::Done
            }
            Stanza::Message(_) => RouteOutcome::Done,
            Stanza::Iq(_) => self.handle_server_iq(source, stanza),
        }
    }

    fn route_to_full(&self, stanza: Stanza, to: &Jid) -> RouteOutcome {
        match self.registry.handle_for(to) {
            Some(handle) => {
                self.deliver(to, handle, stanza);
                RouteOutcome::Done
            }
            None => self.no_session_fallback(stanza),
        }
    }

    fn route_to_bare(&self, stanza: Stanza, to: &Jid) -> RouteOutcome {
        match &stanza {
            Stanza::Message(_) => match self.registry.best_session(to) {
                Some((full, handle)) => {
                    self.deliver(&full, handle, stanza);
                    RouteOutcome::Done
                }
                None => self.no_session_fallback(stanza),
            },
            Stanza::Presence(_) => {
                for (full, handle) in self.registry.all_sessions(to) {
                    self.deliver(&full, handle, stanza.clone());
                }
                RouteOutcome::Done
            }
            Stanza::Iq(iq) => match iq.iq_type {
                IqType::Get | IqType::Set => RouteOutcome::Reply(
                    stanza.error_reply(StanzaErrorKind::ServiceUnavailable, Some(&self.domain)),
                ),
                _ => RouteOutcome::Done,
            },
        }
    }

    /// When no session matches: messages and presence drop, IQ requests are
    /// answered with `service-unavailable`.
    fn no_session_fallback(&self, stanza: Stanza) -> RouteOutcome {
        match &stanza {
            Stanza::Message(_) | Stanza::Presence(_) => {
                debug!("dropping stanza for offline recipient");
                RouteOutcome::Done
            }
            Stanza::Iq(iq) if iq.iq_type.is_request() => RouteOutcome::Reply(
                stanza.error_reply(StanzaErrorKind::ServiceUnavailable, Some(&self.domain)),
            ),
            Stanza::Iq(_) => RouteOutcome::Done,
        }
    }

    fn deliver(&self, to: &Jid, handle: SessionHandle, stanza: Stanza) {
        match handle.stanzas.try_send(stanza) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                // The receiver's queue is full. The stanza is dropped and the
                // overflowing session is closed; backpressure must never
                // propagate to the sender.
                warn!(target_jid = %to, "session mailbox overflow, closing target");
                let _ = handle
                    .control
                    .try_send(SessionControl::Close(StreamErrorKind::PolicyViolation));
            }
            Err(TrySendError::Closed(_)) => {
                debug!(target_jid = %to, "session mailbox closed, dropping stanza");
            }
        }
    }

    /// IQs handled by the server itself.
    fn handle_server_iq(&self, source: &RouteSource, stanza: Stanza) -> RouteOutcome {
        let Stanza::Iq(iq) = &stanza else {
            return RouteOutcome::Done;
        };
        if !iq.iq_type.is_request() {
            // Results and errors directed at the server are absorbed.
            return RouteOutcome::Done;
        }

        let reply = match iq.query_namespace.as_deref() {
            Some(namespaces::PING) => self.iq_result(source, iq, None),
            Some(namespaces::IQ_VERSION) => {
                let mut query = Element::new("query", Some(namespaces::IQ_VERSION));
                query.set_attribute("xmlns", None, namespaces::IQ_VERSION);
                query.with_child("name", Some(namespaces::IQ_VERSION), |name| {
                    name.add_text(SERVER_NAME);
                });
                query.with_child("version", Some(namespaces::IQ_VERSION), |version| {
                    version.add_text(SERVER_VERSION);
                });
                self.iq_result(source, iq, Some(query))
            }
            Some(namespaces::DISCO_INFO) => {
                let mut query = Element::new("query", Some(namespaces::DISCO_INFO));
                query.set_attribute("xmlns", None, namespaces::DISCO_INFO);
                query.with_child("identity", Some(namespaces::DISCO_INFO), |identity| {
                    identity.set_attribute("category", None, "server");
                    identity.set_attribute("type", None, "im");
                    identity.set_attribute("name", None, SERVER_NAME);
                });
                for feature in [
                    namespaces::DISCO_INFO,
                    namespaces::DISCO_ITEMS,
                    namespaces::PING,
                ] {
                    query.with_child("feature", Some(namespaces::DISCO_INFO), |child| {
                        child.set_attribute("var", None, feature);
                    });
                }
                self.iq_result(source, iq, Some(query))
            }
            Some(namespaces::DISCO_ITEMS) => {
                let mut query = Element::new("query", Some(namespaces::DISCO_ITEMS));
                query.set_attribute("xmlns", None, namespaces::DISCO_ITEMS);
                self.iq_result(source, iq, Some(query))
            }
            // Session establishment is a no-op kept for RFC 3921 era clients.
            Some(namespaces::XMPP_SESSION) if iq.iq_type == IqType::Set => {
                self.iq_result(source, iq, None)
            }
            _ => {
                return RouteOutcome::Reply(
                    stanza.error_reply(StanzaErrorKind::FeatureNotImplemented, Some(&self.domain)),
                )
            }
        };

        RouteOutcome::Reply(reply)
    }

    fn iq_result(&self, source: &RouteSource, iq: &Iq, payload: Option<Element>) -> Element {
        let mut result = Element::new("iq", None);
        result.set_attribute("type", None, "result");
        result.set_attribute("id", None, iq.id.clone());
        result.set_attribute("from", None, self.domain.to_string());
        result.set_attribute("to", None, source.full_jid.to_string());
        if let Some(payload) = payload {
            result.add_child(payload);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use palaver_core::xmpp::stanza::{PresenceType, Stanza};

    use crate::registry::ConflictPolicy;

    use super::*;

    struct Session {
        source: RouteSource,
        stanzas: mpsc::Receiver<Stanza>,
        control: mpsc::Receiver<SessionControl>,
    }

    fn setup() -> (Router, Arc<ResourceRegistry>) {
        let registry = Arc::new(ResourceRegistry::new(ConflictPolicy::Suffix));
        let router = Router::new(
            registry.clone(),
            "localhost".parse().unwrap(),
            vec![],
        );
        (router, registry)
    }

    fn bind_session(registry: &ResourceRegistry, bare: &str, resource: &str) -> Session {
        bind_session_with_queue(registry, bare, resource, 8)
    }

    fn bind_session_with_queue(
        registry: &ResourceRegistry,
        bare: &str,
        resource: &str,
        queue: usize,
    ) -> Session {
        let (stanza_tx, stanza_rx) = mpsc::channel(queue);
        let (control_tx, control_rx) = mpsc::channel(8);
        let connection_id = Uuid::new_v4();
        let outcome = registry
            .bind(
                &bare.parse().unwrap(),
                Some(resource),
                connection_id,
                SessionHandle {
                    stanzas: stanza_tx,
                    control: control_tx,
                },
            )
            .unwrap();
        registry.update_presence(&outcome.full_jid, true, 0);
        Session {
            source: RouteSource {
                full_jid: outcome.full_jid,
                connection_id,
            },
            stanzas: stanza_rx,
            control: control_rx,
        }
    }

    fn message_to(to: &str) -> Stanza {
        let mut element = Element::new("message", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("to", None, to);
        element.set_attribute("type", None, "chat");
        element.with_child("body", None, |body| body.add_text("hi"));
        Stanza::parse(element).unwrap()
    }

    fn iq_get(id: &str, to: Option<&str>, payload: Element) -> Stanza {
        let mut element = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("id", None, id);
        element.set_attribute("type", None, "get");
        if let Some(to) = to {
            element.set_attribute("to", None, to);
        }
        element.add_child(payload);
        Stanza::parse(element).unwrap()
    }

    #[test]
    fn message_to_bare_jid_reaches_best_session_with_stamped_from() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let mut bob = bind_session(&registry, "bob@localhost", "desk");

        let outcome = router.route(&alice.source, message_to("bob@localhost"));
        assert!(matches!(outcome, RouteOutcome::Done));

        let delivered = bob.stanzas.try_recv().unwrap();
        assert_eq!(
            delivered.from().unwrap().to_string(),
            "alice@localhost/r1"
        );
        assert_eq!(delivered.to().unwrap().to_string(), "bob@localhost");
    }

    #[test]
    fn message_to_full_jid_reaches_exact_session() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let mut desk = bind_session(&registry, "bob@localhost", "desk");
        let mut phone = bind_session(&registry, "bob@localhost", "phone");

        router.route(&alice.source, message_to("bob@localhost/phone"));
        assert!(phone.stanzas.try_recv().is_ok());
        assert!(desk.stanzas.try_recv().is_err());
    }

    #[test]
    fn message_to_bare_prefers_highest_priority() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let mut desk = bind_session(&registry, "bob@localhost", "desk");
        let mut phone = bind_session(&registry, "bob@localhost", "phone");
        registry.update_presence(&desk.source.full_jid, true, -1);
        registry.update_presence(&phone.source.full_jid, true, 7);

        router.route(&alice.source, message_to("bob@localhost"));
        assert!(phone.stanzas.try_recv().is_ok());
        assert!(desk.stanzas.try_recv().is_err());
    }

    #[test]
    fn message_to_offline_recipient_is_dropped() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let outcome = router.route(&alice.source, message_to("nobody@localhost"));
        assert!(matches!(outcome, RouteOutcome::Done));
    }

    #[test]
    fn presence_to_bare_broadcasts_to_all_sessions() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let mut desk = bind_session(&registry, "bob@localhost", "desk");
        let mut phone = bind_session(&registry, "bob@localhost", "phone");

        let mut element = Element::new("presence", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("to", None, "bob@localhost");
        router.route(&alice.source, Stanza::parse(element).unwrap());

        assert!(desk.stanzas.try_recv().is_ok());
        assert!(phone.stanzas.try_recv().is_ok());
    }

    #[test]
    fn iq_to_bare_jid_of_user_is_service_unavailable() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let stanza = iq_get(
            "q1",
            Some("bob@localhost"),
            Element::new("ping", Some(namespaces::PING)),
        );
        let RouteOutcome::Reply(reply) = router.route(&alice.source, stanza) else {
            panic!("expected reply");
        };
        assert_eq!(reply.attribute("type", None), Some("error"));
        let error = reply.find_child("error", None).unwrap();
        assert!(error
            .find_child("service-unavailable", Some(namespaces::XMPP_STANZA_ERRORS))
            .is_some());
    }

    #[test]
    fn initial_presence_marks_session_available() {
        let (router, registry) = setup();
        let (stanza_tx, _stanza_rx) = mpsc::channel(8);
        let (control_tx, _control_rx) = mpsc::channel(8);
        let connection_id = Uuid::new_v4();
        let outcome = registry
            .bind(
                &"carol@localhost".parse().unwrap(),
                Some("web"),
                connection_id,
                SessionHandle {
                    stanzas: stanza_tx,
                    control: control_tx,
                },
            )
            .unwrap();
        let source = RouteSource {
            full_jid: outcome.full_jid.clone(),
            connection_id,
        };
        assert!(registry
            .best_session(&"carol@localhost".parse().unwrap())
            .is_none());

        let mut presence = Element::new("presence", Some(namespaces::XMPP_CLIENT));
        presence.with_child("priority", None, |p| p.add_text("3"));
        router.route(&source, Stanza::parse(presence).unwrap());

        let (best, _) = registry
            .best_session(&"carol@localhost".parse().unwrap())
            .unwrap();
        assert_eq!(best, outcome.full_jid);
    }

    #[test]
    fn ping_iq_gets_empty_result() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let stanza = iq_get("p1", None, Element::new("ping", Some(namespaces::PING)));
        let RouteOutcome::Reply(reply) = router.route(&alice.source, stanza) else {
            panic!("expected reply");
        };
        assert_eq!(reply.attribute("type", None), Some("result"));
        assert_eq!(reply.attribute("id", None), Some("p1"));
        assert_eq!(reply.attribute("from", None), Some("localhost"));
        assert!(reply.first_child_element().is_none());
    }

    #[test]
    fn version_iq_reports_name_and_version() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let stanza = iq_get(
            "v1",
            Some("localhost"),
            Element::new("query", Some(namespaces::IQ_VERSION)),
        );
        let RouteOutcome::Reply(reply) = router.route(&alice.source, stanza) else {
            panic!("expected reply");
        };
        let query = reply
            .find_child("query", Some(namespaces::IQ_VERSION))
            .unwrap();
        assert!(query.find_child("name", Some(namespaces::IQ_VERSION)).is_some());
        assert!(query
            .find_child("version", Some(namespaces::IQ_VERSION))
            .is_some());
    }

    #[test]
    fn disco_info_reports_server_identity() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let stanza = iq_get(
            "d1",
            Some("localhost"),
            Element::new("query", Some(namespaces::DISCO_INFO)),
        );
        let RouteOutcome::Reply(reply) = router.route(&alice.source, stanza) else {
            panic!("expected reply");
        };
        let query = reply
            .find_child("query", Some(namespaces::DISCO_INFO))
            .unwrap();
        let identity = query
            .find_child("identity", Some(namespaces::DISCO_INFO))
            .unwrap();
        assert_eq!(identity.attribute("category", None), Some("server"));
        assert_eq!(identity.attribute("type", None), Some("im"));
    }

    #[test]
    fn disco_items_is_empty_for_server() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let stanza = iq_get(
            "d2",
            Some("localhost"),
            Element::new("query", Some(namespaces::DISCO_ITEMS)),
        );
        let RouteOutcome::Reply(reply) = router.route(&alice.source, stanza) else {
            panic!("expected reply");
        };
        let query = reply
            .find_child("query", Some(namespaces::DISCO_ITEMS))
            .unwrap();
        assert!(query.first_child_element().is_none());
    }

    #[test]
    fn unknown_server_iq_is_feature_not_implemented() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let stanza = iq_get("x", None, Element::new("unknown", Some("urn:example")));
        let RouteOutcome::Reply(reply) = router.route(&alice.source, stanza) else {
            panic!("expected reply");
        };
        assert_eq!(reply.attribute("type", None), Some("error"));
        assert_eq!(reply.attribute("id", None), Some("x"));
        let error = reply.find_child("error", None).unwrap();
        assert_eq!(error.attribute("type", None), Some("cancel"));
        assert!(error
            .find_child(
                "feature-not-implemented",
                Some(namespaces::XMPP_STANZA_ERRORS)
            )
            .is_some());
    }

    #[test]
    fn spoofed_from_on_message_is_forbidden() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let mut element = Element::new("message", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("from", None, "mallory@localhost");
        element.set_attribute("to", None, "bob@localhost");
        let RouteOutcome::Reply(reply) =
            router.route(&alice.source, Stanza::parse(element).unwrap())
        else {
            panic!("expected reply");
        };
        let error = reply.find_child("error", None).unwrap();
        assert!(error
            .find_child("forbidden", Some(namespaces::XMPP_STANZA_ERRORS))
            .is_some());
    }

    #[test]
    fn spoofed_from_on_iq_is_a_stream_error() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let mut element = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("id", None, "q");
        element.set_attribute("type", None, "get");
        element.set_attribute("from", None, "mallory@localhost");
        element.add_child(Element::new("ping", Some(namespaces::PING)));
        let outcome = router.route(&alice.source, Stanza::parse(element).unwrap());
        assert!(matches!(
            outcome,
            RouteOutcome::Fail(StreamErrorKind::InvalidFrom)
        ));
    }

    #[test]
    fn bare_jid_from_is_accepted() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let mut bob = bind_session(&registry, "bob@localhost", "desk");
        let mut element = Element::new("message", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("from", None, "alice@localhost");
        element.set_attribute("to", None, "bob@localhost");
        let outcome = router.route(&alice.source, Stanza::parse(element).unwrap());
        assert!(matches!(outcome, RouteOutcome::Done));
        assert!(bob.stanzas.try_recv().is_ok());
    }

    #[test]
    fn mailbox_overflow_closes_target_not_sender() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let mut bob = bind_session_with_queue(&registry, "bob@localhost", "desk", 1);

        // First message fills the queue, second overflows it.
        let first = router.route(&alice.source, message_to("bob@localhost"));
        assert!(matches!(first, RouteOutcome::Done));
        let second = router.route(&alice.source, message_to("bob@localhost"));
        assert!(matches!(second, RouteOutcome::Done));

        assert!(matches!(
            bob.control.try_recv().unwrap(),
            SessionControl::Close(StreamErrorKind::PolicyViolation)
        ));
    }

    #[test]
    fn sender_order_is_preserved_per_recipient() {
        let (router, registry) = setup();
        let alice = bind_session(&registry, "alice@localhost", "r1");
        let mut bob = bind_session(&registry, "bob@localhost", "desk");

        for i in 0..5 {
            let mut element = Element::new("message", Some(namespaces::XMPP_CLIENT));
            element.set_attribute("to", None, "bob@localhost");
            element.set_attribute("id", None, format!("m{i}"));
            router.route(&alice.source, Stanza::parse(element).unwrap());
        }
        for i in 0..5 {
            let delivered = bob.stanzas.try_recv().unwrap();
            assert_eq!(delivered.id(), Some(format!("m{i}").as_str()));
        }
    }

    #[test]
    fn presence_probe_type_parses() {
        let mut element = Element::new("presence", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("type", None, "probe");
        let Ok(Stanza::Presence(presence)) = Stanza::parse(element) else {
            panic!("expected presence");
        };
        assert_eq!(presence.presence_type, PresenceType::Probe);
    }
}
