use std::future::Future;
use std::net::SocketAddr;

use anyhow::Error;
use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use crate::xml::stream_parser::StreamParser;
use crate::xml::stream_writer::StreamWriter;

/// A client transport that can be upgraded to TLS in place.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Sized + Send + 'static {
    type Upgrade: Future<Output = Result<Self, Error>> + Send + 'static;

    fn upgrade(self) -> Result<Self::Upgrade, Error>;
    fn is_starttls_allowed(&self) -> bool;
    fn is_secure(&self) -> bool;
    fn is_authenticated(&self) -> bool;
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// The two directions of one XMPP connection: a tokenizer over the read half
/// and a serializer over the write half.
pub struct XmppStream<C, P>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    starttls_allowed: bool,
    secure: bool,
    authenticated: bool,
    remote_addr: Option<SocketAddr>,
    max_stanza_bytes: usize,
    reader: Option<P>,
    writer: Option<StreamWriter<WriteHalf<C>>>,
}

impl<C, P> XmppStream<C, P>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    pub fn new(connection: C, max_stanza_bytes: usize) -> Self {
        let starttls_allowed = connection.is_starttls_allowed();
        let secure = connection.is_secure();
        let authenticated = connection.is_authenticated();
        let remote_addr = connection.remote_addr();
        let (reader, writer) = split(connection);
        let reader = Some(P::new(reader, max_stanza_bytes));
        let writer = Some(StreamWriter::new(writer));

        Self {
            starttls_allowed,
            secure,
            authenticated,
            remote_addr,
            max_stanza_bytes,
            reader,
            writer,
        }
    }

    /// Restarts the XML stream in place after STARTTLS or SASL, keeping the
    /// transport open.
    pub fn reset(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            reader.reset();
        }
        let writer = self.writer.take().unwrap().into_inner();
        self.writer = Some(StreamWriter::new(writer));
    }

    pub fn is_starttls_allowed(&self) -> bool {
        self.starttls_allowed
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn reader(&mut self) -> &mut P {
        self.reader.as_mut().unwrap()
    }

    pub fn writer(&mut self) -> &mut StreamWriter<WriteHalf<C>> {
        self.writer.as_mut().unwrap()
    }

    /// Splits the stream so the tokenizer can move into a dedicated read
    /// task once negotiation has finished.
    pub fn into_parts(mut self) -> (P, StreamWriter<WriteHalf<C>>) {
        let reader = self.reader.take().unwrap();
        let writer = self.writer.take().unwrap();
        (reader, writer)
    }

    pub async fn upgrade_to_tls(&mut self) -> Result<(), Error> {
        let reader = self.reader.take().unwrap().into_inner();
        let writer = self.writer.take().unwrap().into_inner();
        let connection = reader.unsplit(writer);

        let connection = connection.upgrade()?.await?;

        self.starttls_allowed = connection.is_starttls_allowed();
        self.secure = connection.is_secure();
        self.authenticated = connection.is_authenticated();

        let (reader, writer) = split(connection);
        self.reader = Some(P::new(reader, self.max_stanza_bytes));
        self.writer = Some(StreamWriter::new(writer));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use crate::xml::stream_parser::quick_xml::QuickXmlStreamParser;
    use crate::xml::stream_parser::DEFAULT_MAX_STANZA_BYTES;

    use super::*;

    #[derive(Default)]
    struct DummyConnection {
        starttls_allowed: bool,
        secure: bool,
        authenticated: bool,
    }

    impl AsyncRead for DummyConnection {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for DummyConnection {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl Connection for DummyConnection {
        type Upgrade = std::future::Ready<Result<Self, Error>>;

        fn upgrade(mut self) -> Result<Self::Upgrade, Error> {
            self.secure = true;
            Ok(std::future::ready(Ok(self)))
        }

        fn is_starttls_allowed(&self) -> bool {
            self.starttls_allowed
        }

        fn is_secure(&self) -> bool {
            self.secure
        }

        fn is_authenticated(&self) -> bool {
            self.authenticated
        }

        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn stream() -> XmppStream<DummyConnection, QuickXmlStreamParser<ReadHalf<DummyConnection>>> {
        XmppStream::new(DummyConnection::default(), DEFAULT_MAX_STANZA_BYTES)
    }

    #[tokio::test]
    async fn upgrade_works() {
        let mut stream = stream();
        assert!(!stream.is_secure());
        stream.upgrade_to_tls().await.unwrap();
        assert!(stream.is_secure());
    }

    #[test]
    fn reader_and_writer_are_available_after_new() {
        let stream = stream();
        assert!(stream.reader.is_some());
        assert!(stream.writer.is_some());
    }

    #[test]
    fn reader_and_writer_are_available_after_reset() {
        let mut stream = stream();
        stream.reset();
        assert!(stream.reader.is_some());
        assert!(stream.writer.is_some());
    }

    #[tokio::test]
    async fn reader_and_writer_are_available_after_upgrade() {
        let mut stream = stream();
        stream.upgrade_to_tls().await.unwrap();
        assert!(stream.reader.is_some());
        assert!(stream.writer.is_some());
    }
}
