use std::collections::HashMap;

use anyhow::{anyhow, bail, Error};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::xml::{escape_attribute, escape_text, namespaces, Element, Node};
use crate::xmpp::stream_header::{StreamHeader, StreamId};

/// Serializes elements onto the outbound half of an XMPP stream.
///
/// A stack of namespace-to-prefix maps mirrors the element nesting so that
/// elements are emitted with the prefix in scope, or with an inline `xmlns`
/// declaration when no declaration is in scope.
pub struct StreamWriter<W: AsyncWrite + Unpin> {
    writer: W,
    namespaces: Vec<HashMap<String, String>>,
}

impl<W: AsyncWrite + Unpin> StreamWriter<W> {
    pub fn new(writer: W) -> Self {
        let mut root = HashMap::new();
        root.insert(namespaces::XML.to_string(), "xml".to_string());
        root.insert(namespaces::XMLNS.to_string(), "xmlns".to_string());

        Self {
            writer,
            namespaces: vec![root],
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub async fn write_stream_header(
        &mut self,
        header: &StreamHeader,
        include_xml_declaration: bool,
    ) -> Result<(), Error> {
        if include_xml_declaration {
            self.write_str("<?xml version='1.0'?>").await?;
        }

        let Some(ref from) = header.from else {
            bail!("`from` field is required in outgoing stream header");
        };
        let id = header.id.clone().unwrap_or_else(StreamId::new);

        let mut stream_element = Element::new("stream", Some(namespaces::XMPP_STREAMS));
        stream_element.set_attribute("from", None, from.to_string());
        if let Some(to) = &header.to {
            stream_element.set_attribute("to", None, to.to_string());
        }
        stream_element.set_attribute("id", None, id.to_string());
        stream_element.set_attribute("version", None, "1.0");
        stream_element.set_attribute("lang", Some(namespaces::XML), "en");
        stream_element.set_attribute("xmlns", None, namespaces::XMPP_CLIENT);
        stream_element.set_attribute("stream", Some(namespaces::XMLNS), namespaces::XMPP_STREAMS);

        let opening_tag = self.build_opening_tag(&stream_element, false);
        self.write_str(&opening_tag).await
    }

    pub async fn write_stream_close(&mut self) -> Result<(), Error> {
        let stream_element = Element::new("stream", Some(namespaces::XMPP_STREAMS));
        let closing_tag = self.build_closing_tag(&stream_element);
        self.write_str(&closing_tag).await
    }

    pub async fn write_xml_element(&mut self, element: &Element) -> Result<(), Error> {
        let xml = self.build_xml_element(element);
        self.write_str(&xml).await
    }

    async fn write_str(&mut self, string: &str) -> Result<(), Error> {
        self.writer
            .write_all(string.as_bytes())
            .await
            .map_err(|err| anyhow!(err))?;

        self.writer.flush().await.map_err(|err| anyhow!(err))
    }

    fn lookup_namespace_prefix(&self, namespace: &str) -> Option<&str> {
        for namespaces in self.namespaces.iter().rev() {
            if let Some(prefix) = namespaces.get(namespace) {
                return Some(prefix);
            }
        }

        None
    }

    fn build_xml_element(&mut self, element: &Element) -> String {
        let mut xml = String::new();

        if !element.children.is_empty() {
            xml.push_str(&self.build_opening_tag(element, false));
            xml.push_str(&self.build_children(element));
            xml.push_str(&self.build_closing_tag(element));
        } else {
            xml.push_str(&self.build_opening_tag(element, true));
        }

        xml
    }

    fn build_opening_tag(&mut self, element: &Element, self_closing: bool) -> String {
        let mut xml = String::new();

        // Collect namespace declarations carried by this element.
        let mut scope = HashMap::new();
        for ((attribute, namespace), value) in &element.attributes {
            match namespace {
                Some(namespace) if namespace == namespaces::XMLNS => {
                    scope.insert(value.clone(), attribute.clone());
                }
                None if attribute == "xmlns" => {
                    scope.insert(value.clone(), String::new());
                }
                _ => {}
            }
        }

        // An element in a namespace with no declaration in scope gets a
        // default declaration added inline.
        let mut extra_declaration = None;
        if let Some(namespace) = &element.namespace {
            let declared = scope.contains_key(namespace)
                || self.lookup_namespace_prefix(namespace).is_some();
            if !declared {
                scope.insert(namespace.clone(), String::new());
                extra_declaration = Some(namespace.clone());
            }
        }
        self.namespaces.push(scope);

        match &element.namespace {
            Some(namespace) => match self.lookup_namespace_prefix(namespace) {
                Some("") | None => {
                    xml.push_str(&format!("<{}", element.name));
                }
                Some(prefix) => {
                    xml.push_str(&format!("<{}:{}", prefix, element.name));
                }
            },
            None => {
                xml.push_str(&format!("<{}", element.name));
            }
        }

        if let Some(namespace) = extra_declaration {
            xml.push_str(&format!(r#" xmlns="{}""#, escape_attribute(&namespace)));
        }
        xml.push_str(&self.build_attributes(element));

        if self_closing {
            self.namespaces.pop();
            xml.push_str("/>");
        } else {
            xml.push('>');
        }

        xml
    }

    fn build_attributes(&self, element: &Element) -> String {
        let mut xml = String::new();

        for ((attribute, namespace), value) in &element.attributes {
            match namespace {
                Some(namespace) => match self.lookup_namespace_prefix(namespace) {
                    Some("") | None => {
                        // Attributes cannot live in a default namespace;
                        // emit without prefix rather than drop the attribute.
                        xml.push_str(&format!(r#" {}="{}""#, attribute, escape_attribute(value)));
                    }
                    Some(prefix) => {
                        xml.push_str(&format!(
                            r#" {}:{}="{}""#,
                            prefix,
                            attribute,
                            escape_attribute(value)
                        ));
                    }
                },
                None => {
                    xml.push_str(&format!(r#" {}="{}""#, attribute, escape_attribute(value)));
                }
            }
        }

        xml
    }

    fn build_children(&mut self, element: &Element) -> String {
        let mut xml = String::new();

        for child in &element.children {
            match child {
                Node::Element(child_element) => {
                    xml.push_str(&self.build_xml_element(child_element));
                }
                Node::Text(text) => {
                    xml.push_str(&escape_text(text));
                }
                Node::CData(cdata) => {
                    xml.push_str(&format!("<![CDATA[{}]]>", cdata));
                }
            }
        }

        xml
    }

    fn build_closing_tag(&mut self, element: &Element) -> String {
        let mut xml = String::new();

        match &element.namespace {
            Some(namespace) => match self.lookup_namespace_prefix(namespace) {
                Some("") | None => {
                    xml.push_str(&format!("</{}>", element.name));
                }
                Some(prefix) => {
                    xml.push_str(&format!("</{}:{}>", prefix, element.name));
                }
            },
            None => {
                xml.push_str(&format!("</{}>", element.name));
            }
        }

        self.namespaces.pop();

        xml
    }
}
