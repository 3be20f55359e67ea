//! Named-placeholder rendering for command strings and finding descriptions.
//!
//! Templates use `{name}` placeholders; `{{` and `}}` produce literal braces.
//! A context is built once per scan invocation and never mutated afterwards:
//! host-level for primary scans, host plus service variables for secondary
//! scans.

use std::borrow::Cow;

use crate::error::{ReconError, Result};

/// Per-service variables available to secondary scan templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceVars {
    pub port: u16,
    pub protocol: String,
    pub name: String,
    pub secure: bool,
    pub scheme: String,
    pub username_wordlist: String,
    pub password_wordlist: String,
}

/// Immutable variable mapping used to render one scan's templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateContext {
    address: String,
    scandir: String,
    nmap_extra: String,
    ports: String,
    service: Option<ServiceVars>,
}

impl TemplateContext {
    /// Host-level context used by primary scans.
    pub fn for_host(
        address: impl Into<String>,
        scandir: impl Into<String>,
        nmap_extra: impl Into<String>,
        ports: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            scandir: scandir.into(),
            nmap_extra: nmap_extra.into(),
            ports: ports.into(),
            service: None,
        }
    }

    /// New context carrying this host's values plus one discovered service.
    pub fn with_service(&self, service: ServiceVars) -> Self {
        Self {
            service: Some(service),
            ..self.clone()
        }
    }

    /// True when this context belongs to a per-service (ported) scan.
    pub fn is_service_scoped(&self) -> bool {
        self.service.is_some()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn service(&self) -> Option<&ServiceVars> {
        self.service.as_ref()
    }

    /// Look up a variable by placeholder name.
    pub fn lookup(&self, name: &str) -> Option<Cow<'_, str>> {
        let host = match name {
            "address" => Some(&self.address),
            "scandir" => Some(&self.scandir),
            "nmap_extra" => Some(&self.nmap_extra),
            "ports" => Some(&self.ports),
            _ => None,
        };
        if let Some(v) = host {
            return Some(Cow::Borrowed(v.as_str()));
        }

        let svc = self.service.as_ref()?;
        match name {
            "port" => Some(Cow::Owned(svc.port.to_string())),
            "protocol" => Some(Cow::Borrowed(&svc.protocol)),
            "name" => Some(Cow::Borrowed(&svc.name)),
            "secure" => Some(Cow::Borrowed(if svc.secure { "true" } else { "false" })),
            "scheme" => Some(Cow::Borrowed(&svc.scheme)),
            "username_wordlist" => Some(Cow::Borrowed(&svc.username_wordlist)),
            "password_wordlist" => Some(Cow::Borrowed(&svc.password_wordlist)),
            _ => None,
        }
    }

    /// Substitute every placeholder in `template`.
    pub fn render(&self, template: &str) -> Result<String> {
        render_with(template, |name| self.lookup(name))
    }

    /// Like [`render`](Self::render), with an extra `{match}` variable bound
    /// to the text a pattern matched.
    pub fn render_with_match(&self, template: &str, matched: &str) -> Result<String> {
        render_with(template, |name| {
            if name == "match" {
                Some(Cow::Borrowed(matched))
            } else {
                self.lookup(name)
            }
        })
    }
}

fn render_with<'a, F>(template: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<Cow<'a, str>>,
{
    let unbalanced = || ReconError::UnbalancedTemplate {
        template: template.to_string(),
    };

    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err(unbalanced());
                }
                let value = lookup(&name).ok_or_else(|| ReconError::MissingVariable {
                    variable: name.clone(),
                    template: template.to_string(),
                })?;
                out.push_str(&value);
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(unbalanced()),
            other => out.push(other),
        }
    }
    Ok(out)
}
