use std::collections::BTreeMap;
use std::fmt::Display;

use base64::prelude::*;
use rand::{RngCore, SeedableRng};

use crate::xmpp::jid::Jid;

/// Opaque stream identifier stamped on outbound stream headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamId(String);

impl StreamId {
    pub fn new() -> Self {
        let mut rng = rand_chacha::ChaCha20Rng::from_entropy();
        let mut id_raw = [0u8; 16];
        rng.fill_bytes(&mut id_raw);

        Self(BASE64_STANDARD.encode(id_raw))
    }

    pub fn from_string(id: String) -> Self {
        Self(id)
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageTag(pub String);

impl Display for LanguageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The attributes of a `<stream:stream>` open tag, either received or about
/// to be sent.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<StreamId>,
    pub language: Option<LanguageTag>,
    pub version: Option<String>,
    pub default_namespace: Option<String>,
    pub declared_prefixes: BTreeMap<String, String>,
}
