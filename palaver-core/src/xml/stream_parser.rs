use std::future::Future;

use tokio::io::AsyncRead;

use crate::xml::Element;
use crate::xmpp::error::StreamErrorKind;
use crate::xmpp::stream_header::StreamHeader;

pub mod quick_xml;

pub const DEFAULT_MAX_STANZA_BYTES: usize = 65536;

/// One parsed unit of an XMPP stream.
#[derive(Debug)]
pub enum Frame {
    /// The `<stream:stream>` open tag, emitted once per stream generation
    /// (again after a reset).
    StreamStart(StreamHeader),
    /// A complete top-level child element of the stream.
    XmlFragment(Element),
    /// The matching `</stream:stream>` close tag.
    StreamEnd,
}

/// Fatal tokenizer conditions. Except for `Io`, each maps onto the stream
/// error the connection announces before closing.
#[derive(Debug, thiserror::Error)]
pub enum StreamParseError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream is not well-formed XML: {0}")]
    NotWellFormed(String),
    #[error("stream data is malformed: {0}")]
    BadFormat(String),
    #[error("stream contains restricted XML: {0}")]
    RestrictedXml(&'static str),
    #[error("stream declares an unsupported encoding")]
    UnsupportedEncoding,
    #[error("stream open tag carries an invalid namespace")]
    InvalidNamespace,
    #[error("stanza exceeds the limit of {0} octets")]
    StanzaTooLarge(usize),
}

impl StreamParseError {
    /// The stream error to announce for this condition, if any. Transport
    /// errors close the connection without a stream error.
    pub fn stream_error_kind(&self) -> Option<StreamErrorKind> {
        match self {
            StreamParseError::Io(_) => None,
            StreamParseError::NotWellFormed(_) => Some(StreamErrorKind::NotWellFormed),
            StreamParseError::BadFormat(_) => Some(StreamErrorKind::BadFormat),
            StreamParseError::RestrictedXml(_) => Some(StreamErrorKind::RestrictedXml),
            StreamParseError::UnsupportedEncoding => Some(StreamErrorKind::UnsupportedEncoding),
            StreamParseError::InvalidNamespace => Some(StreamErrorKind::InvalidNamespace),
            StreamParseError::StanzaTooLarge(_) => Some(StreamErrorKind::PolicyViolation),
        }
    }
}

/// Incremental tokenizer over a streamed XML document.
///
/// Implementations must accept input split at arbitrary byte boundaries and
/// must treat a parse error as terminal for the stream.
pub trait StreamParser<R>: Send + Sized
where
    R: AsyncRead + Unpin + Send,
{
    fn new(reader: R, max_stanza_bytes: usize) -> Self;

    /// Reads the next frame. `Ok(None)` signals a clean end of input.
    fn read_frame(
        &mut self,
    ) -> impl Future<Output = Result<Option<Frame>, StreamParseError>> + Send;

    /// Discards parser state and expects a fresh XML declaration plus stream
    /// header, as required after STARTTLS and after SASL success. Bytes
    /// already received but not yet parsed are kept.
    fn reset(&mut self);

    fn into_inner(self) -> R;
}
