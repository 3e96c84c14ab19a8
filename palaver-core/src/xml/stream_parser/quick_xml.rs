use std::collections::HashMap;
use std::future::Future;
use std::str;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Reader;
use tokio::io::{AsyncRead, BufReader};

use crate::xml::{namespaces, Element, Node};
use crate::xmpp::stream_header::{LanguageTag, StreamHeader, StreamId};

use super::{Frame, StreamParseError, StreamParser};

/// Namespace declarations introduced by one element.
#[derive(Debug, Default)]
struct NsScope {
    /// `xmlns="…"`; an empty string records an explicit un-declaration.
    default_namespace: Option<String>,
    /// `xmlns:prefix="…"`.
    prefixes: HashMap<String, String>,
}

/// Streaming tokenizer backed by quick-xml's incremental reader.
///
/// Namespace prefixes are resolved against a scope stack so that stanzas
/// inherit the default namespace declared on the stream root. The stream
/// root element itself is never materialized; its open and close tags are
/// surfaced as `StreamStart` and `StreamEnd` frames.
pub struct QuickXmlStreamParser<R> {
    reader: Option<Reader<BufReader<R>>>,
    event_buffer: Vec<u8>,
    scopes: Vec<NsScope>,
    open_elements: Vec<(Element, String)>,
    awaiting_stream_start: bool,
    unframed_bytes: usize,
    max_stanza_bytes: usize,
}

impl<R> StreamParser<R> for QuickXmlStreamParser<R>
where
    R: AsyncRead + Unpin + Send,
{
    fn new(reader: R, max_stanza_bytes: usize) -> Self {
        Self {
            reader: Some(Reader::from_reader(BufReader::new(reader))),
            event_buffer: Vec::new(),
            scopes: Vec::new(),
            open_elements: Vec::new(),
            awaiting_stream_start: true,
            unframed_bytes: 0,
            max_stanza_bytes,
        }
    }

    fn read_frame(
        &mut self,
    ) -> impl Future<Output = Result<Option<Frame>, StreamParseError>> + Send {
        async move {
            loop {
                self.event_buffer.clear();
                let reader = self.reader.as_mut().expect("reader is present outside reset");
                let event = match reader.read_event_into_async(&mut self.event_buffer).await {
                    Ok(event) => event.into_owned(),
                    Err(err) => return Err(convert_error(err)),
                };

                if matches!(event, Event::Eof) {
                    return Ok(None);
                }

                self.unframed_bytes = self.unframed_bytes.saturating_add(event_octets(&event));
                if self.unframed_bytes > self.max_stanza_bytes {
                    return Err(StreamParseError::StanzaTooLarge(self.max_stanza_bytes));
                }

                if let Some(frame) = self.process_event(event)? {
                    return Ok(Some(frame));
                }
            }
        }
    }

    fn reset(&mut self) {
        if let Some(reader) = self.reader.take() {
            // A fresh reader drops the old document state; bytes buffered but
            // not yet parsed carry over into the new stream generation.
            self.reader = Some(Reader::from_reader(reader.into_inner()));
        }
        self.scopes.clear();
        self.open_elements.clear();
        self.awaiting_stream_start = true;
        self.unframed_bytes = 0;
    }

    fn into_inner(self) -> R {
        self.reader
            .expect("reader is present outside reset")
            .into_inner()
            .into_inner()
    }
}

impl<R> QuickXmlStreamParser<R>
where
    R: AsyncRead + Unpin + Send,
{
    fn process_event(&mut self, event: Event<'static>) -> Result<Option<Frame>, StreamParseError> {
        match event {
            Event::Decl(decl) => {
                if !self.awaiting_stream_start {
                    return Err(StreamParseError::RestrictedXml("xml declaration"));
                }
                if let Some(encoding) = decl.encoding() {
                    let encoding = encoding
                        .map_err(|err| StreamParseError::BadFormat(err.to_string()))?;
                    if !encoding.eq_ignore_ascii_case(b"utf-8") {
                        return Err(StreamParseError::UnsupportedEncoding);
                    }
                }
                Ok(None)
            }
            Event::DocType(_) => Err(StreamParseError::RestrictedXml("doctype declaration")),
            Event::Comment(_) => Err(StreamParseError::RestrictedXml("comment")),
            Event::PI(_) => Err(StreamParseError::RestrictedXml("processing instruction")),
            Event::Start(start) => self.handle_start(&start, false),
            Event::Empty(start) => self.handle_start(&start, true),
            Event::End(end) => self.handle_end(&end),
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|err| StreamParseError::BadFormat(err.to_string()))?
                    .into_owned();
                match self.open_elements.last_mut() {
                    Some((element, _)) => {
                        element.add_text(text);
                        Ok(None)
                    }
                    None if text.trim().is_empty() => {
                        // Whitespace keep-alive between stanzas.
                        self.unframed_bytes = 0;
                        Ok(None)
                    }
                    None => Err(StreamParseError::BadFormat(
                        "character data at stream level".to_string(),
                    )),
                }
            }
            Event::CData(cdata) => {
                let content = String::from_utf8(cdata.into_inner().into_owned())
                    .map_err(|_| StreamParseError::BadFormat("invalid UTF-8 in CDATA".to_string()))?;
                match self.open_elements.last_mut() {
                    Some((element, _)) => {
                        element.children.push(Node::CData(content));
                        Ok(None)
                    }
                    None => Err(StreamParseError::BadFormat(
                        "CDATA at stream level".to_string(),
                    )),
                }
            }
            Event::Eof => Ok(None),
        }
    }

    fn handle_start(
        &mut self,
        start: &BytesStart<'static>,
        self_closing: bool,
    ) -> Result<Option<Frame>, StreamParseError> {
        let raw_name = utf8(start.name().as_ref())?.to_string();
        let (prefix, local) = split_qname(&raw_name);
        let prefix = prefix.map(|p| p.to_string());
        let local = local.to_string();

        let mut scope = NsScope::default();
        // (prefix, local name, value) triples, declarations excluded
        let mut plain_attributes: Vec<(Option<String>, String, String)> = Vec::new();
        // declarations to be kept on the element for re-serialization
        let mut declarations: Vec<(String, Option<&'static str>, String)> = Vec::new();

        for attribute in start.attributes() {
            let attribute =
                attribute.map_err(|err| StreamParseError::NotWellFormed(err.to_string()))?;
            let value = attribute
                .unescape_value()
                .map_err(|err| StreamParseError::BadFormat(err.to_string()))?
                .into_owned();
            let key_local = utf8(attribute.key.local_name().as_ref())?.to_string();
            match attribute.key.prefix() {
                Some(p) if p.as_ref() == b"xmlns" => {
                    declarations.push((key_local.clone(), Some(namespaces::XMLNS), value.clone()));
                    scope.prefixes.insert(key_local, value);
                }
                Some(p) => {
                    plain_attributes.push((Some(utf8(p.as_ref())?.to_string()), key_local, value));
                }
                None if key_local == "xmlns" => {
                    declarations.push(("xmlns".to_string(), None, value.clone()));
                    scope.default_namespace = Some(value);
                }
                None => plain_attributes.push((None, key_local, value)),
            }
        }

        self.scopes.push(scope);
        let namespace = match self.resolve_element_namespace(prefix.as_deref()) {
            Ok(namespace) => namespace,
            Err(err) => {
                self.scopes.pop();
                return Err(err);
            }
        };

        let is_stream_root = self.open_elements.is_empty()
            && local == "stream"
            && namespace.as_deref() == Some(namespaces::XMPP_STREAMS);

        if is_stream_root {
            if self_closing {
                return Err(StreamParseError::NotWellFormed(
                    "stream root must not be self-closing".to_string(),
                ));
            }
            if !self.awaiting_stream_start {
                return Err(StreamParseError::NotWellFormed(
                    "unexpected second stream header".to_string(),
                ));
            }
            self.awaiting_stream_start = false;
            self.unframed_bytes = 0;
            let header = self.build_stream_header(&plain_attributes);
            // The root scope stays on the stack so stanzas inherit its
            // declarations.
            return Ok(Some(Frame::StreamStart(header)));
        }

        if self.awaiting_stream_start {
            self.scopes.pop();
            return Err(StreamParseError::InvalidNamespace);
        }

        let mut element = Element::new(&local, namespace.as_deref());
        for (name, ns, value) in declarations {
            element.set_attribute(&name, ns, value);
        }
        for (prefix, name, value) in plain_attributes {
            let ns = self.resolve_attribute_namespace(prefix.as_deref())?;
            element.set_attribute(&name, ns.as_deref(), value);
        }

        if self_closing {
            self.scopes.pop();
            match self.open_elements.last_mut() {
                Some((parent, _)) => {
                    parent.add_child(element);
                    Ok(None)
                }
                None => {
                    self.unframed_bytes = 0;
                    Ok(Some(Frame::XmlFragment(element)))
                }
            }
        } else {
            self.open_elements.push((element, raw_name));
            Ok(None)
        }
    }

    fn handle_end(&mut self, end: &BytesEnd<'static>) -> Result<Option<Frame>, StreamParseError> {
        let raw_name = utf8(end.name().as_ref())?.to_string();
        match self.open_elements.pop() {
            Some((element, open_name)) => {
                if open_name != raw_name {
                    return Err(StreamParseError::NotWellFormed(format!(
                        "end tag </{raw_name}> does not match <{open_name}>"
                    )));
                }
                self.scopes.pop();
                match self.open_elements.last_mut() {
                    Some((parent, _)) => {
                        parent.add_child(element);
                        Ok(None)
                    }
                    None => {
                        self.unframed_bytes = 0;
                        Ok(Some(Frame::XmlFragment(element)))
                    }
                }
            }
            None => {
                let (prefix, local) = split_qname(&raw_name);
                let namespace = self.resolve_element_namespace(prefix)?;
                if local == "stream"
                    && namespace.as_deref() == Some(namespaces::XMPP_STREAMS)
                    && !self.awaiting_stream_start
                {
                    Ok(Some(Frame::StreamEnd))
                } else {
                    Err(StreamParseError::NotWellFormed(format!(
                        "unmatched end tag </{raw_name}>"
                    )))
                }
            }
        }
    }

    fn build_stream_header(
        &self,
        attributes: &[(Option<String>, String, String)],
    ) -> StreamHeader {
        let mut header = StreamHeader::default();
        for (prefix, name, value) in attributes {
            match (prefix.as_deref(), name.as_str()) {
                (None, "from") => header.from = value.parse().ok(),
                (None, "to") => header.to = value.parse().ok(),
                (None, "id") => header.id = Some(StreamId::from_string(value.clone())),
                (None, "version") => header.version = Some(value.clone()),
                (Some("xml"), "lang") => header.language = Some(LanguageTag(value.clone())),
                _ => {}
            }
        }
        if let Some(scope) = self.scopes.last() {
            header.default_namespace = scope
                .default_namespace
                .clone()
                .filter(|ns| !ns.is_empty());
            for (prefix, ns) in &scope.prefixes {
                header.declared_prefixes.insert(prefix.clone(), ns.clone());
            }
        }
        header
    }

    fn resolve_element_namespace(
        &self,
        prefix: Option<&str>,
    ) -> Result<Option<String>, StreamParseError> {
        match prefix {
            None => {
                let declared = self
                    .scopes
                    .iter()
                    .rev()
                    .find_map(|scope| scope.default_namespace.clone());
                Ok(declared.filter(|ns| !ns.is_empty()))
            }
            Some("xml") => Ok(Some(namespaces::XML.to_string())),
            Some(prefix) => self
                .scopes
                .iter()
                .rev()
                .find_map(|scope| scope.prefixes.get(prefix))
                .cloned()
                .map(Some)
                .ok_or_else(|| {
                    StreamParseError::NotWellFormed(format!(
                        "undeclared namespace prefix `{prefix}`"
                    ))
                }),
        }
    }

    fn resolve_attribute_namespace(
        &self,
        prefix: Option<&str>,
    ) -> Result<Option<String>, StreamParseError> {
        match prefix {
            None => Ok(None),
            Some("xml") => Ok(Some(namespaces::XML.to_string())),
            Some(prefix) => self
                .scopes
                .iter()
                .rev()
                .find_map(|scope| scope.prefixes.get(prefix))
                .cloned()
                .map(Some)
                .ok_or_else(|| {
                    StreamParseError::NotWellFormed(format!(
                        "undeclared namespace prefix `{prefix}`"
                    ))
                }),
        }
    }
}

/// Reconstructs how many octets an event occupied on the wire.
fn event_octets(event: &Event) -> usize {
    match event {
        Event::Start(e) => e.len() + 2,   // <…>
        Event::End(e) => e.len() + 3,     // </…>
        Event::Empty(e) => e.len() + 3,   // <…/>
        Event::Text(e) => e.len(),
        Event::CData(e) => e.len() + 12,  // <![CDATA[…]]>
        Event::Comment(e) => e.len() + 7, // <!--…-->
        Event::Decl(e) => e.len() + 4,    // <?…?>
        Event::PI(e) => e.len() + 4,
        Event::DocType(e) => e.len() + 10,
        Event::Eof => 0,
    }
}

fn convert_error(err: quick_xml::Error) -> StreamParseError {
    match err {
        quick_xml::Error::Io(io) => StreamParseError::Io(std::io::Error::new(
            io.kind(),
            io.to_string(),
        )),
        other => StreamParseError::NotWellFormed(other.to_string()),
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, StreamParseError> {
    str::from_utf8(bytes)
        .map_err(|_| StreamParseError::BadFormat("invalid UTF-8 in markup".to_string()))
}

fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}
