//! Service discovery from a primary scan's XML result.
//!
//! Only the fields the engine needs are read: port id, protocol, state,
//! service name and the TLS tunnel marker.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::Path;

use roxmltree::{Document, Node, ParsingOptions};
use tracing::warn;

use crate::config::{ServiceRule, ServiceScans};
use crate::error::{ReconError, Result};
use crate::template::{ServiceVars, TemplateContext};
use crate::types::DetectedService;

/// A port entry from the scan result, before the closed-port filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEntry {
    pub port: u16,
    pub protocol: String,
    pub state: String,
    pub service: String,
    /// Service is wrapped in SSL/TLS.
    pub secure: bool,
}

impl PortEntry {
    pub fn is_closed(&self) -> bool {
        self.state.eq_ignore_ascii_case("closed")
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure || self.service.to_ascii_lowercase().contains("https") {
            "https"
        } else {
            "http"
        }
    }

    pub fn detected(&self) -> DetectedService {
        DetectedService {
            port: self.port,
            protocol: self.protocol.clone(),
            name: self.service.clone(),
            state: self.state.clone(),
        }
    }

    /// Context for this service's secondary scans.
    pub fn context(&self, host: &TemplateContext, services: &ServiceScans) -> TemplateContext {
        host.with_service(ServiceVars {
            port: self.port,
            protocol: self.protocol.clone(),
            name: self.service.clone(),
            secure: self.secure,
            scheme: self.scheme().to_string(),
            username_wordlist: services.username_wordlist.clone(),
            password_wordlist: services.password_wordlist.clone(),
        })
    }
}

/// Parse every `<port>` element of an nmap-style XML document.
///
/// Entries missing a port id, protocol or state are skipped with a warning.
/// A `<port>` without a `<service>` child gets the name `unknown`.
pub fn parse_scan_result(xml: &str, path: &Path) -> Result<Vec<PortEntry>> {
    let opts = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let doc = Document::parse_with_options(xml, opts).map_err(|e| {
        ReconError::MalformedScanResult {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    })?;

    let mut entries = Vec::new();
    for node in doc.descendants().filter(|n| n.has_tag_name("port")) {
        match port_entry(node) {
            Some(entry) => entries.push(entry),
            None => warn!(
                file = %path.display(),
                position = node.range().start,
                "skipping incomplete port entry"
            ),
        }
    }
    Ok(entries)
}

fn port_entry(node: Node<'_, '_>) -> Option<PortEntry> {
    let port = node.attribute("portid")?.trim().parse::<u16>().ok()?;
    let protocol = node.attribute("protocol")?.to_string();
    let state = child(node, "state")?.attribute("state")?.to_string();

    let (service, secure) = match child(node, "service") {
        Some(svc) => {
            let name = svc.attribute("name").unwrap_or("unknown").to_string();
            let tunnel = svc.attribute("tunnel").unwrap_or("");
            let lowered = name.to_ascii_lowercase();
            let secure = tunnel.eq_ignore_ascii_case("ssl")
                || tunnel.eq_ignore_ascii_case("tls")
                || lowered.contains("ssl")
                || lowered.contains("tls")
                || lowered.contains("https");
            (name, secure)
        }
        None => ("unknown".to_string(), false),
    };

    Some(PortEntry {
        port,
        protocol,
        state,
        service,
        secure,
    })
}

fn child<'a, 'i>(node: Node<'a, 'i>, tag: &str) -> Option<Node<'a, 'i>> {
    node.children().find(|c| c.has_tag_name(tag))
}

/// Rules (with their index) whose service-name patterns match
/// `service_name`. All matches fire; there is no first-match short circuit.
pub fn matching_rules<'a>(
    rules: &'a [ServiceRule],
    service_name: &'a str,
) -> impl Iterator<Item = (usize, &'a ServiceRule)> + 'a {
    rules
        .iter()
        .enumerate()
        .filter(move |(_, r)| r.matches(service_name))
}

/// Compare strings so that embedded numbers order numerically:
/// `"2/tcp"` sorts before `"10/tcp"`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ca = chunks(a);
    let mut cb = chunks(b);
    loop {
        match (ca.next(), cb.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (is_digits(x), is_digits(y)) {
                    (true, true) => cmp_numeric(x, y),
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (false, false) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

fn is_digits(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit())
}

fn cmp_numeric(x: &str, y: &str) -> Ordering {
    let x = x.trim_start_matches('0');
    let y = y.trim_start_matches('0');
    x.len().cmp(&y.len()).then_with(|| x.cmp(y))
}

/// Split into maximal runs of ASCII digits and non-digits.
fn chunks(s: &str) -> impl Iterator<Item = &str> {
    let mut rest = s;
    std::iter::from_fn(move || {
        let first = rest.chars().next()?;
        let digit = first.is_ascii_digit();
        let end = rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() != digit)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let (head, tail) = rest.split_at(end);
        rest = tail;
        Some(head)
    })
}

/// The set of detected services, rendered as a naturally sorted log.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashSet<DetectedService>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the service was already known.
    pub fn insert(&mut self, service: DetectedService) -> bool {
        self.services.insert(service)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn sorted_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.services.iter().map(ToString::to_string).collect();
        lines.sort_by(|a, b| natural_cmp(a, b));
        lines
    }

    pub fn render_log(&self) -> String {
        self.sorted_lines()
            .into_iter()
            .map(|l| l + "\n")
            .collect()
    }
}
