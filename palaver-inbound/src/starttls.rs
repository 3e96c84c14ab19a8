use anyhow::{bail, Error};
use tokio::io::ReadHalf;
use tracing::debug;

use palaver_core::xml::stream_parser::StreamParser;
use palaver_core::xml::{namespaces, Element};
use palaver_core::xmpp::stream::{Connection, XmppStream};

pub(crate) struct StarttlsNegotiator {
    _private: (),
}

impl StarttlsNegotiator {
    pub fn advertise_feature(required: bool) -> Element {
        let mut starttls = Element::new("starttls", Some(namespaces::XMPP_STARTTLS));
        starttls.set_attribute("xmlns", None, namespaces::XMPP_STARTTLS);
        if required {
            starttls.add_child(Element::new("required", Some(namespaces::XMPP_STARTTLS)));
        }
        starttls
    }

    /// Answers `<proceed/>` and performs the TLS handshake in place. On
    /// return the stream has fresh reader and writer state and awaits a new
    /// stream header.
    pub async fn negotiate_feature<C, P>(
        stream: &mut XmppStream<C, P>,
        element: &Element,
    ) -> Result<(), Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        if !element.validate("starttls", Some(namespaces::XMPP_STARTTLS)) {
            bail!("expected starttls element");
        }

        let mut proceed = Element::new("proceed", Some(namespaces::XMPP_STARTTLS));
        proceed.set_attribute("xmlns", None, namespaces::XMPP_STARTTLS);
        stream.writer().write_xml_element(&proceed).await?;

        stream.upgrade_to_tls().await?;
        debug!("TLS established");

        Ok(())
    }

    /// The `<failure/>` answer for a STARTTLS request that cannot proceed.
    pub fn failure() -> Element {
        let mut failure = Element::new("failure", Some(namespaces::XMPP_STARTTLS));
        failure.set_attribute("xmlns", None, namespaces::XMPP_STARTTLS);
        failure
    }
}
