//! Resource-rules file parsing.
//!
//! The rules file is an XML document enumerating the intranet URLs this
//! agent is authorized to expose:
//!
//! ```xml
//! <resourceRules>
//!   <rule agentId="agent-1" allowedUsers="alice@corp.example">
//!     <url>https://intranet.example:443/wiki</url>
//!   </rule>
//! </resourceRules>
//! ```
//!
//! The field-level schema belongs to the server; this parser only extracts
//! the `(url, agentId, allowedUsers?)` tuples the core needs, and validates
//! that every URL yields a usable `(host, port)` for key minting.

use quick_xml::events::Event;
use quick_xml::Reader;
use url::Url;

use crate::error::AgentError;

/// One parsed resource declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRule {
    pub url: String,
    pub host: String,
    pub port: u16,
    pub agent_id: Option<String>,
    pub allowed_users: Option<Vec<String>>,
}

/// Parses the raw rules-file bytes. A rule whose URL lacks a host or a
/// resolvable port fails the whole parse: registration must never be
/// partial.
pub fn parse_rules(raw: &[u8]) -> Result<Vec<ResourceRule>, AgentError> {
    let mut reader = Reader::from_reader(raw);
    reader.trim_text(true);

    let mut rules = Vec::new();
    let mut buf = Vec::new();
    let mut current: Option<PendingRule> = None;
    let mut in_url = false;

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| AgentError::Config(format!("rules file is not valid XML: {e}")))?
        {
            Event::Start(ref e) if e.name().as_ref() == b"rule" => {
                current = Some(PendingRule::from_attributes(e)?);
            }
            // A self-closed <rule/> has no <url> child and fails like any
            // other rule without one.
            Event::Empty(ref e) if e.name().as_ref() == b"rule" => {
                rules.push(PendingRule::from_attributes(e)?.finish()?);
            }
            Event::Start(ref e) if e.name().as_ref() == b"url" => {
                in_url = current.is_some();
            }
            Event::Text(t) if in_url => {
                let text = t
                    .unescape()
                    .map_err(|e| AgentError::Config(format!("rules file escape error: {e}")))?;
                if let Some(pending) = current.as_mut() {
                    pending.url.push_str(text.trim());
                }
            }
            Event::End(ref e) if e.name().as_ref() == b"url" => {
                in_url = false;
            }
            Event::End(ref e) if e.name().as_ref() == b"rule" => {
                let pending = current.take().ok_or_else(|| {
                    AgentError::Config("rules file has a stray </rule>".into())
                })?;
                rules.push(pending.finish()?);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(rules)
}

#[derive(Debug, Default)]
struct PendingRule {
    url: String,
    agent_id: Option<String>,
    allowed_users: Option<Vec<String>>,
}

impl PendingRule {
    fn from_attributes(element: &quick_xml::events::BytesStart<'_>) -> Result<PendingRule, AgentError> {
        let mut pending = PendingRule::default();
        for attr in element.attributes() {
            let attr =
                attr.map_err(|e| AgentError::Config(format!("rules file attribute error: {e}")))?;
            let value = attr
                .unescape_value()
                .map_err(|e| AgentError::Config(format!("rules file escape error: {e}")))?
                .into_owned();
            match attr.key.as_ref() {
                b"agentId" => pending.agent_id = Some(value),
                b"allowedUsers" => {
                    let users: Vec<String> = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned)
                        .collect();
                    if !users.is_empty() {
                        pending.allowed_users = Some(users);
                    }
                }
                _ => {}
            }
        }
        Ok(pending)
    }

    fn finish(self) -> Result<ResourceRule, AgentError> {
        if self.url.is_empty() {
            return Err(AgentError::ResourceUrl {
                url: String::new(),
                reason: "rule has no <url> element".into(),
            });
        }
        let parsed = Url::parse(&self.url).map_err(|e| AgentError::ResourceUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| AgentError::ResourceUrl {
                url: self.url.clone(),
                reason: "url has no host".into(),
            })?
            .to_owned();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| AgentError::ResourceUrl {
                url: self.url.clone(),
                reason: "url has no port and no default for its scheme".into(),
            })?;
        Ok(ResourceRule {
            url: self.url,
            host,
            port,
            agent_id: self.agent_id,
            allowed_users: self.allowed_users,
        })
    }
}
