use std::collections::BTreeMap;

pub mod namespaces;
pub mod stream_parser;
pub mod stream_writer;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
}

/// A single XML element with resolved namespaces.
///
/// Attributes are keyed by `(name, namespace)`; an attribute in no namespace
/// uses `None`. Attribute order is kept stable so serialized output is
/// deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub(crate) name: String,
    pub(crate) namespace: Option<String>,
    pub(crate) attributes: BTreeMap<(String, Option<String>), String>,
    pub(crate) children: Vec<Node>,
}

impl Element {
    pub fn new(name: &str, namespace: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.map(|s| s.to_string()),
            attributes: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn validate(&self, name: &str, namespace: Option<&str>) -> bool {
        self.name == name && self.namespace.as_deref() == namespace
    }

    pub fn attribute(&self, name: &str, namespace: Option<&str>) -> Option<&str> {
        self.attributes
            .get(&(name.to_string(), namespace.map(|s| s.to_string())))
            .map(|s| s.as_str())
    }

    pub fn set_attribute(&mut self, name: &str, namespace: Option<&str>, value: impl Into<String>) {
        self.attributes.insert(
            (name.to_string(), namespace.map(|s| s.to_string())),
            value.into(),
        );
    }

    pub fn remove_attribute(&mut self, name: &str, namespace: Option<&str>) -> Option<String> {
        self.attributes
            .remove(&(name.to_string(), namespace.map(|s| s.to_string())))
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, Option<&str>, &str)> {
        self.attributes
            .iter()
            .map(|((name, ns), value)| (name.as_str(), ns.as_deref(), value.as_str()))
    }

    pub fn find_child(&self, name: &str, namespace: Option<&str>) -> Option<&Element> {
        self.child_elements()
            .find(|element| element.validate(name, namespace))
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|child| match child {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    pub fn first_child_element(&self) -> Option<&Element> {
        self.child_elements().next()
    }

    pub fn text(&self) -> String {
        let mut text = String::new();
        for child in &self.children {
            match child {
                Node::Element(element) => text.push_str(&element.text()),
                Node::Text(s) => text.push_str(s),
                Node::CData(s) => text.push_str(s),
            }
        }
        text
    }

    pub fn add_child(&mut self, element: Element) {
        self.children.push(Node::Element(element));
    }

    pub fn with_child<F>(&mut self, name: &str, namespace: Option<&str>, f: F)
    where
        F: FnOnce(&mut Element),
    {
        let mut element = Element::new(name, namespace);
        f(&mut element);
        self.children.push(Node::Element(element));
    }

    pub fn add_text(&mut self, text: impl Into<String>) {
        self.children.push(Node::Text(text.into()));
    }
}

/// Escapes character data for use as element text.
pub fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Escapes character data for use inside a double-quoted attribute value.
pub fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_simple() {
        let element = Element::new("foo", Some("bar"));
        assert!(element.validate("foo", Some("bar")));
    }

    #[test]
    fn validate_different_name() {
        let element = Element::new("foo", Some("bar"));
        assert!(!element.validate("baz", Some("bar")));
    }

    #[test]
    fn validate_different_namespace() {
        let element = Element::new("foo", Some("bar"));
        assert!(!element.validate("foo", Some("baz")));
    }

    #[test]
    fn attribute_simple() {
        let mut element = Element::new("foo", Some("bar"));
        element.set_attribute("baz", None, "qux");
        assert_eq!(element.attribute("baz", None), Some("qux"));
    }

    #[test]
    fn attribute_missing() {
        let element = Element::new("foo", Some("bar"));
        assert_eq!(element.attribute("baz", None), None);
    }

    #[test]
    fn attribute_overwrite() {
        let mut element = Element::new("foo", Some("bar"));
        element.set_attribute("baz", None, "qux");
        element.set_attribute("baz", None, "overwritten");
        assert_eq!(element.attribute("baz", None), Some("overwritten"));
    }

    #[test]
    fn child_single() {
        let mut parent = Element::new("foo", Some("bar"));
        parent.add_child(Element::new("baz", Some("qux")));
        assert!(parent.find_child("baz", Some("qux")).is_some());
    }

    #[test]
    fn child_multiple() {
        let mut parent = Element::new("foo", Some("bar"));
        parent.add_child(Element::new("baz", Some("baz")));
        parent.add_child(Element::new("qux", Some("qux")));
        assert!(parent.find_child("qux", Some("qux")).is_some());
        assert_eq!(parent.child_elements().count(), 2);
    }

    #[test]
    fn child_missing() {
        let parent = Element::new("foo", Some("bar"));
        assert!(parent.find_child("baz", Some("qux")).is_none());
    }

    #[test]
    fn child_helper() {
        let mut parent = Element::new("foo", Some("bar"));
        parent.with_child("baz", Some("qux"), |child| {
            child.set_attribute("quux", None, "corge");
        });
        assert_eq!(
            parent
                .find_child("baz", Some("qux"))
                .unwrap()
                .attribute("quux", None),
            Some("corge")
        );
    }

    #[test]
    fn text_simple() {
        let mut element = Element::new("foo", Some("bar"));
        element.add_text("baz");
        assert_eq!(element.text(), "baz");
    }

    #[test]
    fn text_nested() {
        let mut parent = Element::new("foo", Some("bar"));
        parent.add_text("before");
        parent.with_child("baz", Some("qux"), |child| {
            child.add_text("inside");
        });
        parent.add_text("after");
        assert_eq!(parent.text(), "beforeinsideafter");
    }

    #[test]
    fn escape_text_replaces_markup() {
        assert_eq!(escape_text("a < b & c > d"), "a &lt; b &amp; c &gt; d");
    }

    #[test]
    fn escape_attribute_replaces_quotes() {
        assert_eq!(escape_attribute(r#"say "hi""#), "say &quot;hi&quot;");
        assert_eq!(escape_attribute("it's"), "it&apos;s");
    }
}
