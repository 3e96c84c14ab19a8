use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use tokio::io::ReadHalf;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use palaver_core::xml::stream_parser::{Frame, StreamParseError, StreamParser};
use palaver_core::xml::{namespaces, Element};
use palaver_core::xmpp::error::{SaslFailureKind, StanzaErrorKind, StreamErrorKind};
use palaver_core::xmpp::jid::Jid;
use palaver_core::xmpp::stanza::{stanza_error_reply, Stanza};
use palaver_core::xmpp::stream::{Connection, XmppStream};
use palaver_core::xmpp::stream_header::{StreamHeader, StreamId};
use palaver_services::registry::{
    ConnectionId, ResourceRegistry, SessionControl, SessionHandle,
};
use palaver_services::router::{RouteOutcome, RouteSource, Router};

use crate::bind::ResourceBindingNegotiator;
use crate::sasl::{AuthProvider, Mechanism, SaslNegotiator, SaslOutcome};
use crate::starttls::StarttlsNegotiator;

mod bind;
pub mod connection;
pub mod sasl;
mod starttls;

/// Negotiation progress of one connection (RFC 6120 §4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PreStream,
    StreamOpened,
    TlsNegotiating,
    SaslNegotiating,
    Authenticated,
    Binding,
    Bound,
    Closing,
    Closed,
}

#[derive(Debug, Hash, Eq, PartialEq)]
enum StreamFeature {
    Tls,
    Authentication,
    ResourceBinding,
}

/// Per-connection record, owned exclusively by the connection task. Shared
/// services only ever see the connection id and the channel handles.
#[derive(Debug)]
pub struct ConnectionState {
    pub connection_id: ConnectionId,
    pub phase: Phase,
    negotiated_features: HashSet<StreamFeature>,
    pub bound_jid: Option<Jid>,
    pub authenticated_jid: Option<Jid>,
    pub tls_active: bool,
    pub remote_addr: Option<SocketAddr>,
    pub created_at: Instant,
    pub last_activity_at: Instant,
}

/// Connection-level configuration, extracted from the settings tree.
#[derive(Debug, Clone)]
pub struct InboundConfig {
    pub domain: Jid,
    pub tls_enabled: bool,
    pub tls_required: bool,
    pub max_stanza_bytes: usize,
    pub queue_size: usize,
    pub idle_timeout: Duration,
    pub sasl_mechanisms: Vec<Mechanism>,
    pub sasl_max_attempts: u32,
    pub sasl_timeout: Duration,
}

impl InboundConfig {
    pub fn new(domain: Jid) -> Self {
        Self {
            domain,
            tls_enabled: false,
            tls_required: false,
            max_stanza_bytes: 65536,
            queue_size: 1000,
            idle_timeout: Duration::from_secs(30 * 60),
            sasl_mechanisms: vec![
                Mechanism::Plain,
                Mechanism::ScramSha1,
                Mechanism::ScramSha256,
            ],
            sasl_max_attempts: 3,
            sasl_timeout: Duration::from_secs(30),
        }
    }
}

enum NegotiationEnd {
    Bound,
    Closed,
}

/// The state machine driving one client connection from stream open through
/// negotiation into stanza exchange.
///
/// Negotiation is strictly sequential. Once bound, the tokenizer moves into
/// a dedicated read task and the connection task multiplexes inbound frames,
/// its stanza mailbox, control messages, shutdown and the idle deadline.
pub struct InboundStream<C, P, A>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
    A: AuthProvider,
{
    stream: XmppStream<C, P>,
    state: ConnectionState,
    config: InboundConfig,
    provider: A,
    router: Arc<Router>,
    registry: Arc<ResourceRegistry>,
    stanza_tx: mpsc::Sender<Stanza>,
    stanza_rx: mpsc::Receiver<Stanza>,
    control_tx: mpsc::Sender<SessionControl>,
    control_rx: mpsc::Receiver<SessionControl>,
    shutdown: watch::Receiver<bool>,
}

impl<C, P, A> InboundStream<C, P, A>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>> + 'static,
    A: AuthProvider,
{
    pub fn new(
        connection: C,
        router: Arc<Router>,
        registry: Arc<ResourceRegistry>,
        provider: A,
        config: InboundConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let now = Instant::now();
        let state = ConnectionState {
            connection_id: Uuid::new_v4(),
            phase: Phase::PreStream,
            negotiated_features: HashSet::new(),
            bound_jid: None,
            authenticated_jid: None,
            tls_active: connection.is_secure(),
            remote_addr: connection.remote_addr(),
            created_at: now,
            last_activity_at: now,
        };
        let stream = XmppStream::new(connection, config.max_stanza_bytes);
        let (stanza_tx, stanza_rx) = mpsc::channel(config.queue_size);
        let (control_tx, control_rx) = mpsc::channel(8);

        Self {
            stream,
            state,
            config,
            provider,
            router,
            registry,
            stanza_tx,
            stanza_rx,
            control_tx,
            control_rx,
            shutdown,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.state.connection_id
    }

    pub async fn handle(mut self) {
        let connection_id = self.state.connection_id;
        debug!(connection = %connection_id, remote = ?self.state.remote_addr, "inbound stream opened");

        match self.negotiate().await {
            Ok(NegotiationEnd::Bound) => self.serve().await,
            Ok(NegotiationEnd::Closed) => {
                self.registry.release_connection(connection_id);
            }
            Err(error) => {
                warn!(connection = %connection_id, %error, "closing stream after internal error");
                let _ = self
                    .stream
                    .writer()
                    .write_xml_element(&StreamErrorKind::InternalServerError.to_element())
                    .await;
                let _ = self.stream.writer().write_stream_close().await;
                self.registry.release_connection(connection_id);
            }
        }
    }

    /// Drives the connection until it is bound or closed. Stream errors are
    /// handled here; only internal failures surface as `Err`.
    async fn negotiate(&mut self) -> Result<NegotiationEnd, Error> {
        let mut sasl_attempts: u32 = 0;

        loop {
            let deadline = self.state.last_activity_at + self.config.idle_timeout;
            let frame = match timeout_at(deadline, self.stream.reader().read_frame()).await {
                Err(_) => return Ok(self.fail(StreamErrorKind::ConnectionTimeout).await),
                Ok(Err(parse_error)) => return Ok(self.fail_parse(parse_error).await),
                Ok(Ok(frame)) => frame,
            };
            self.state.last_activity_at = Instant::now();

            let Some(frame) = frame else {
                // Peer went away without closing the stream.
                let _ = self.stream.writer().write_stream_close().await;
                self.state.phase = Phase::Closed;
                return Ok(NegotiationEnd::Closed);
            };

            match frame {
                Frame::StreamEnd => {
                    let _ = self.stream.writer().write_stream_close().await;
                    self.state.phase = Phase::Closed;
                    return Ok(NegotiationEnd::Closed);
                }
                Frame::StreamStart(header) => {
                    if let Some(end) = self.handle_stream_open(header).await? {
                        return Ok(end);
                    }
                }
                Frame::XmlFragment(element) => {
                    let end = match self.state.phase {
                        Phase::StreamOpened => {
                            self.handle_pre_auth_element(element, &mut sasl_attempts)
                                .await?
                        }
                        Phase::Authenticated => self.handle_authenticated_element(element).await?,
                        _ => Some(self.fail(StreamErrorKind::NotAuthorized).await),
                    };
                    if let Some(end) = end {
                        return Ok(end);
                    }
                    if self.state.phase == Phase::Bound {
                        return Ok(NegotiationEnd::Bound);
                    }
                }
            }
        }
    }

    async fn handle_stream_open(
        &mut self,
        header: StreamHeader,
    ) -> Result<Option<NegotiationEnd>, Error> {
        match self.state.phase {
            Phase::PreStream | Phase::StreamOpened | Phase::Authenticated => {}
            _ => return Ok(Some(self.fail(StreamErrorKind::NotWellFormed).await)),
        }

        if header.default_namespace.as_deref() != Some(namespaces::XMPP_CLIENT) {
            return Ok(Some(self.fail(StreamErrorKind::InvalidNamespace).await));
        }
        match header.version.as_deref() {
            Some(version) if version.starts_with("1.") => {}
            _ => return Ok(Some(self.fail(StreamErrorKind::UnsupportedVersion).await)),
        }
        if let Some(to) = &header.to {
            if !self.router.is_local_domain(to) {
                return Ok(Some(self.fail(StreamErrorKind::HostUnknown).await));
            }
        }

        self.send_stream_header(header.from.clone()).await?;
        self.advertise_features().await?;
        if self.state.phase == Phase::PreStream {
            self.state.phase = Phase::StreamOpened;
        }

        Ok(None)
    }

    async fn handle_pre_auth_element(
        &mut self,
        element: Element,
        sasl_attempts: &mut u32,
    ) -> Result<Option<NegotiationEnd>, Error> {
        if element.validate("starttls", Some(namespaces::XMPP_STARTTLS)) {
            if !self.stream.is_starttls_allowed() {
                let _ = self
                    .stream
                    .writer()
                    .write_xml_element(&StarttlsNegotiator::failure())
                    .await;
                return Ok(Some(self.fail(StreamErrorKind::PolicyViolation).await));
            }

            self.state.phase = Phase::TlsNegotiating;
            StarttlsNegotiator::negotiate_feature(&mut self.stream, &element).await?;
            self.state.tls_active = true;
            self.state.negotiated_features.insert(StreamFeature::Tls);
            // The upgraded stream starts over and awaits a fresh header.
            self.state.phase = Phase::StreamOpened;
            return Ok(None);
        }

        if element.validate("auth", Some(namespaces::XMPP_SASL)) {
            if self.config.tls_required && !self.state.tls_active {
                return Ok(Some(self.fail(StreamErrorKind::PolicyViolation).await));
            }

            *sasl_attempts += 1;
            self.state.phase = Phase::SaslNegotiating;
            let negotiation = SaslNegotiator::negotiate_feature(
                &mut self.stream,
                &element,
                &self.provider,
                &self.config.domain,
                &self.config.sasl_mechanisms,
                self.config.tls_enabled,
            );
            match timeout(self.config.sasl_timeout, negotiation).await {
                Err(_) => {
                    let _ = self
                        .stream
                        .writer()
                        .write_xml_element(
                            &SaslFailureKind::TemporaryAuthFailure.to_element(),
                        )
                        .await;
                    return Ok(Some(self.fail(StreamErrorKind::ConnectionTimeout).await));
                }
                Ok(Err(error)) => return Err(error),
                Ok(Ok(SaslOutcome::Authenticated(jid))) => {
                    info!(connection = %self.state.connection_id, jid = %jid, "authenticated");
                    self.state.authenticated_jid = Some(jid);
                    self.state
                        .negotiated_features
                        .insert(StreamFeature::Authentication);
                    self.state.phase = Phase::Authenticated;
                    self.stream.reset();
                }
                Ok(Ok(SaslOutcome::Failed)) => {
                    if *sasl_attempts >= self.config.sasl_max_attempts {
                        debug!(
                            connection = %self.state.connection_id,
                            attempts = *sasl_attempts,
                            "authentication attempt limit reached"
                        );
                        return Ok(Some(self.fail(StreamErrorKind::PolicyViolation).await));
                    }
                    self.state.phase = Phase::StreamOpened;
                }
            }
            return Ok(None);
        }

        // Anything else before authentication is a protocol violation.
        if self.config.tls_required && !self.state.tls_active {
            return Ok(Some(self.fail(StreamErrorKind::PolicyViolation).await));
        }
        Ok(Some(self.fail(StreamErrorKind::NotAuthorized).await))
    }

    async fn handle_authenticated_element(
        &mut self,
        element: Element,
    ) -> Result<Option<NegotiationEnd>, Error> {
        let Some(authenticated) = self.state.authenticated_jid.clone() else {
            return Ok(Some(self.fail(StreamErrorKind::InternalServerError).await));
        };

        match element.name() {
            "iq" if element.find_child("bind", Some(namespaces::XMPP_BIND)).is_some() => {
                self.state.phase = Phase::Binding;
                let handle = SessionHandle {
                    stanzas: self.stanza_tx.clone(),
                    control: self.control_tx.clone(),
                };
                let bound = ResourceBindingNegotiator::negotiate_feature(
                    &mut self.stream,
                    &element,
                    &authenticated,
                    &self.registry,
                    self.state.connection_id,
                    handle,
                )
                .await?;
                match bound {
                    Some(full_jid) => {
                        info!(connection = %self.state.connection_id, jid = %full_jid, "resource bound");
                        self.state.bound_jid = Some(full_jid);
                        self.state
                            .negotiated_features
                            .insert(StreamFeature::ResourceBinding);
                        self.state.phase = Phase::Bound;
                    }
                    None => self.state.phase = Phase::Authenticated,
                }
                Ok(None)
            }
            "iq" if element
                .find_child("session", Some(namespaces::XMPP_SESSION))
                .is_some() =>
            {
                // Session establishment is accepted as a no-op.
                let mut reply = Element::new("iq", None);
                if let Some(id) = element.attribute("id", None) {
                    reply.set_attribute("id", None, id);
                }
                reply.set_attribute("type", None, "result");
                self.stream.writer().write_xml_element(&reply).await?;
                Ok(None)
            }
            "iq" | "message" | "presence" => {
                let reply = stanza_error_reply(
                    &element,
                    StanzaErrorKind::UnexpectedRequest.default_type(),
                    StanzaErrorKind::UnexpectedRequest,
                    Some(&self.config.domain),
                );
                self.stream.writer().write_xml_element(&reply).await?;
                Ok(None)
            }
            _ => Ok(Some(self.fail(StreamErrorKind::NotAuthorized).await)),
        }
    }

    /// Stanza exchange after binding. The tokenizer runs in its own task so
    /// this loop can multiplex without ever cancelling a read mid-frame.
    async fn serve(self) {
        let Self {
            stream,
            state,
            config,
            provider: _provider,
            router,
            registry,
            stanza_tx: _stanza_tx,
            mut stanza_rx,
            control_tx: _control_tx,
            mut control_rx,
            mut shutdown,
            ..
        } = self;

        let Some(full_jid) = state.bound_jid.clone() else {
            registry.release_connection(state.connection_id);
            return;
        };
        let source = RouteSource {
            full_jid,
            connection_id: state.connection_id,
        };

        let (mut parser, mut writer) = stream.into_parts();
        let (frame_tx, mut frame_rx) = mpsc::channel(config.queue_size);
        let reader_task = tokio::spawn(async move {
            loop {
                let frame = parser.read_frame().await;
                let terminal = !matches!(frame, Ok(Some(_)));
                if frame_tx.send(frame).await.is_err() || terminal {
                    break;
                }
            }
        });

        let mut last_activity = Instant::now();
        let close_reason: Option<StreamErrorKind> = loop {
            let idle_deadline = last_activity + config.idle_timeout;
            tokio::select! {
                maybe_frame = frame_rx.recv() => {
                    last_activity = Instant::now();
                    match maybe_frame {
                        None | Some(Ok(None)) => break None,
                        Some(Ok(Some(Frame::StreamEnd))) => break None,
                        Some(Ok(Some(Frame::StreamStart(_)))) => {
                            break Some(StreamErrorKind::NotWellFormed);
                        }
                        Some(Ok(Some(Frame::XmlFragment(element)))) => {
                            match handle_bound_element(&router, &source, element, &mut writer).await {
                                Ok(None) => {}
                                Ok(Some(kind)) => break Some(kind),
                                Err(_) => break None,
                            }
                        }
                        Some(Err(parse_error)) => {
                            debug!(connection = %state.connection_id, error = %parse_error, "parse error");
                            break parse_error.stream_error_kind();
                        }
                    }
                }
                Some(stanza) = stanza_rx.recv() => {
                    if writer.write_xml_element(stanza.element()).await.is_err() {
                        break None;
                    }
                }
                Some(control) = control_rx.recv() => {
                    match control {
                        SessionControl::Close(kind) => break Some(kind),
                    }
                }
                changed = shutdown.changed() => {
                    match changed {
                        Ok(()) if *shutdown.borrow_and_update() => {
                            break Some(StreamErrorKind::SystemShutdown);
                        }
                        Ok(()) => {}
                        Err(_) => break None,
                    }
                }
                _ = sleep_until(idle_deadline) => {
                    break Some(StreamErrorKind::ConnectionTimeout);
                }
            }
        };

        if let Some(kind) = close_reason {
            let _ = writer.write_xml_element(&kind.to_element()).await;
        }
        let _ = writer.write_stream_close().await;

        reader_task.abort();
        let released = registry.release_connection(state.connection_id);
        debug!(connection = %state.connection_id, released, "connection closed");
    }

    async fn advertise_features(&mut self) -> Result<(), Error> {
        let mut features = Element::new("features", Some(namespaces::XMPP_STREAMS));

        if self.state.authenticated_jid.is_none() {
            if self.stream.is_starttls_allowed() && !self.state.tls_active {
                features.add_child(StarttlsNegotiator::advertise_feature(
                    self.config.tls_required,
                ));
            }
            if !self.config.tls_required || self.state.tls_active {
                features.add_child(SaslNegotiator::advertise_feature(
                    &self.config.sasl_mechanisms,
                    self.stream.is_secure(),
                    self.config.tls_enabled,
                ));
            }
        } else if self.state.bound_jid.is_none() {
            features.add_child(ResourceBindingNegotiator::advertise_feature());
            features.add_child(ResourceBindingNegotiator::advertise_session_feature());
        }

        self.stream.writer().write_xml_element(&features).await
    }

    async fn send_stream_header(&mut self, to: Option<Jid>) -> Result<(), Error> {
        let header = StreamHeader {
            from: Some(self.config.domain.clone()),
            to,
            id: Some(StreamId::new()),
            language: None,
            version: Some("1.0".to_string()),
            default_namespace: None,
            declared_prefixes: Default::default(),
        };
        self.stream.writer().write_stream_header(&header, true).await
    }

    /// Announces a stream error and closes. Pre-stream failures first send
    /// our own header so the error is well-formed XMPP.
    async fn fail(&mut self, kind: StreamErrorKind) -> NegotiationEnd {
        debug!(connection = %self.state.connection_id, error = %kind, "stream failed");
        let pre_stream = self.state.phase == Phase::PreStream;
        self.state.phase = Phase::Closing;
        if pre_stream {
            let _ = self.send_stream_header(None).await;
        }
        let _ = self
            .stream
            .writer()
            .write_xml_element(&kind.to_element())
            .await;
        let _ = self.stream.writer().write_stream_close().await;
        self.state.phase = Phase::Closed;
        NegotiationEnd::Closed
    }

    async fn fail_parse(&mut self, error: StreamParseError) -> NegotiationEnd {
        debug!(connection = %self.state.connection_id, %error, "parse error");
        match error.stream_error_kind() {
            Some(kind) => self.fail(kind).await,
            None => {
                self.state.phase = Phase::Closed;
                NegotiationEnd::Closed
            }
        }
    }
}

/// Parses and routes one top-level element on a bound stream. Returns a
/// stream error kind when the element was fatal, `Err` when the transport
/// went away.
async fn handle_bound_element<W>(
    router: &Router,
    source: &RouteSource,
    element: Element,
    writer: &mut palaver_core::xml::stream_writer::StreamWriter<W>,
) -> Result<Option<StreamErrorKind>, Error>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    match Stanza::parse(element) {
        Ok(stanza) => match router.route(source, stanza) {
            RouteOutcome::Done => Ok(None),
            RouteOutcome::Reply(reply) => {
                writer.write_xml_element(&reply).await?;
                Ok(None)
            }
            RouteOutcome::Fail(kind) => Ok(Some(kind)),
        },
        Err(parse_error) => match parse_error.kind.stanza_error() {
            Some(kind) => {
                let reply = stanza_error_reply(
                    &parse_error.element,
                    kind.default_type(),
                    kind,
                    Some(router.domain()),
                );
                writer.write_xml_element(&reply).await?;
                Ok(None)
            }
            None => Ok(Some(StreamErrorKind::UnsupportedStanzaType)),
        },
    }
}
