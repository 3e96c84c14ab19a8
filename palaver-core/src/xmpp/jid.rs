use std::fmt::{Display, Formatter};
use std::str::FromStr;

use stringprep::{nameprep, nodeprep, resourceprep};

/// Maximum length of each JID part after normalization, in octets (RFC 6122).
const MAX_PART_OCTETS: usize = 1023;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JidError {
    #[error("JID is empty")]
    Empty,
    #[error("localpart is empty")]
    EmptyLocal,
    #[error("domainpart is empty")]
    EmptyDomain,
    #[error("resourcepart is empty")]
    EmptyResource,
    #[error("{0} exceeds 1023 octets")]
    TooLong(&'static str),
    #[error("{0} contains a prohibited character")]
    ProhibitedCharacter(&'static str),
}

/// A Jabber ID: `[local@]domain[/resource]`.
///
/// Parts are normalized on construction with the RFC 6122 stringprep
/// profiles: nodeprep (casefolding) for the localpart, nameprep for the
/// domainpart and resourceprep (case preserving) for the resourcepart.
/// Equality and hashing operate on the normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(
        local: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Self, JidError> {
        let local = match local {
            Some("") => return Err(JidError::EmptyLocal),
            Some(local) => Some(prepare_local(local)?),
            None => None,
        };
        let domain = prepare_domain(domain)?;
        let resource = match resource {
            Some("") => return Err(JidError::EmptyResource),
            Some(resource) => Some(prepare_resource(resource)?),
            None => None,
        };

        Ok(Jid {
            local,
            domain,
            resource,
        })
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// The JID without its resourcepart.
    pub fn to_bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Attaches a resourcepart, replacing any existing one.
    pub fn bind(&self, resource: &str) -> Result<Jid, JidError> {
        if resource.is_empty() {
            return Err(JidError::EmptyResource);
        }
        Ok(Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: Some(prepare_resource(resource)?),
        })
    }
}

impl FromStr for Jid {
    type Err = JidError;

    /// The domain/resource boundary is the first `/`; the local/domain
    /// boundary is the last `@` before it.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(JidError::Empty);
        }

        let (before_slash, resource) = match s.find('/') {
            Some(i) => (&s[..i], Some(&s[i + 1..])),
            None => (s, None),
        };

        let (local, domain) = match before_slash.rfind('@') {
            Some(i) => (Some(&before_slash[..i]), &before_slash[i + 1..]),
            None => (None, before_slash),
        };

        Jid::new(local, domain, resource)
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

fn prepare_local(local: &str) -> Result<String, JidError> {
    let prepared = nodeprep(local)
        .map_err(|_| JidError::ProhibitedCharacter("localpart"))?
        .into_owned();
    if prepared.is_empty() {
        return Err(JidError::EmptyLocal);
    }
    if prepared.len() > MAX_PART_OCTETS {
        return Err(JidError::TooLong("localpart"));
    }
    // nodeprep already prohibits these, but the boundary is load-bearing for
    // parsing so it is checked explicitly as well.
    if prepared
        .chars()
        .any(|c| c.is_control() || c.is_whitespace() || "\"&'/:<>@".contains(c))
    {
        return Err(JidError::ProhibitedCharacter("localpart"));
    }
    Ok(prepared)
}

fn prepare_domain(domain: &str) -> Result<String, JidError> {
    if domain.is_empty() {
        return Err(JidError::EmptyDomain);
    }
    let prepared = nameprep(domain)
        .map_err(|_| JidError::ProhibitedCharacter("domainpart"))?
        .into_owned();
    if prepared.is_empty() {
        return Err(JidError::EmptyDomain);
    }
    if prepared.len() > MAX_PART_OCTETS {
        return Err(JidError::TooLong("domainpart"));
    }
    Ok(prepared)
}

fn prepare_resource(resource: &str) -> Result<String, JidError> {
    let prepared = resourceprep(resource)
        .map_err(|_| JidError::ProhibitedCharacter("resourcepart"))?
        .into_owned();
    if prepared.is_empty() {
        return Err(JidError::EmptyResource);
    }
    if prepared.len() > MAX_PART_OCTETS {
        return Err(JidError::TooLong("resourcepart"));
    }
    if prepared.chars().any(|c| c.is_control()) {
        return Err(JidError::ProhibitedCharacter("resourcepart"));
    }
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_on_empty_string() {
        assert_eq!("".parse::<Jid>(), Err(JidError::Empty));
    }

    #[test]
    fn parse_domain_only() {
        let jid = "localhost".parse::<Jid>().unwrap();
        assert_eq!(jid.local(), None);
        assert_eq!(jid.domain(), "localhost");
        assert_eq!(jid.resource(), None);
    }

    #[test]
    fn parse_bare() {
        let jid = "alice@localhost".parse::<Jid>().unwrap();
        assert_eq!(jid.local(), Some("alice"));
        assert_eq!(jid.domain(), "localhost");
        assert!(jid.is_bare());
    }

    #[test]
    fn parse_full() {
        let jid = "alice@localhost/tablet".parse::<Jid>().unwrap();
        assert_eq!(jid.local(), Some("alice"));
        assert_eq!(jid.domain(), "localhost");
        assert_eq!(jid.resource(), Some("tablet"));
    }

    #[test]
    fn resource_may_contain_slashes_and_at() {
        let jid = "alice@localhost/home/desk@work".parse::<Jid>().unwrap();
        assert_eq!(jid.resource(), Some("home/desk@work"));
    }

    #[test]
    fn domain_with_resource_but_no_local() {
        let jid = "localhost/console".parse::<Jid>().unwrap();
        assert_eq!(jid.local(), None);
        assert_eq!(jid.resource(), Some("console"));
    }

    #[test]
    fn empty_local_with_at_is_invalid() {
        assert_eq!("@localhost".parse::<Jid>(), Err(JidError::EmptyLocal));
    }

    #[test]
    fn empty_resource_with_slash_is_invalid() {
        assert_eq!(
            "alice@localhost/".parse::<Jid>(),
            Err(JidError::EmptyResource)
        );
    }

    #[test]
    fn empty_domain_is_invalid() {
        assert_eq!("alice@".parse::<Jid>(), Err(JidError::EmptyDomain));
        assert_eq!("alice@/r".parse::<Jid>(), Err(JidError::EmptyDomain));
    }

    #[test]
    fn local_is_casefolded_resource_is_not() {
        let jid = "ALICE@LocalHost/Tablet".parse::<Jid>().unwrap();
        assert_eq!(jid.local(), Some("alice"));
        assert_eq!(jid.domain(), "localhost");
        assert_eq!(jid.resource(), Some("Tablet"));
    }

    #[test]
    fn equality_on_normalized_form() {
        let a = "Alice@Localhost".parse::<Jid>().unwrap();
        let b = "alice@localhost".parse::<Jid>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn prohibited_characters_in_local() {
        for jid in ["a b@localhost", "a<b@localhost", "a\"b@localhost"] {
            assert!(jid.parse::<Jid>().is_err(), "{jid} should be invalid");
        }
    }

    #[test]
    fn local_length_limit() {
        let local = "a".repeat(1024);
        assert_eq!(
            Jid::new(Some(&local), "localhost", None),
            Err(JidError::TooLong("localpart"))
        );
        let local = "a".repeat(1023);
        assert!(Jid::new(Some(&local), "localhost", None).is_ok());
    }

    #[test]
    fn serialize_round_trip() {
        for s in ["localhost", "alice@localhost", "alice@localhost/tablet"] {
            let jid = s.parse::<Jid>().unwrap();
            assert_eq!(jid.to_string().parse::<Jid>().unwrap(), jid);
        }
    }

    #[test]
    fn to_bare_drops_resource() {
        let jid = "alice@localhost/tablet".parse::<Jid>().unwrap();
        assert_eq!(jid.to_bare().to_string(), "alice@localhost");
    }

    #[test]
    fn bind_attaches_resource() {
        let bare = "alice@localhost".parse::<Jid>().unwrap();
        let full = bare.bind("tablet").unwrap();
        assert_eq!(full.to_string(), "alice@localhost/tablet");
    }
}
