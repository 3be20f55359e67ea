//! TOML configuration: primary scans, service rules and universal patterns.
//!
//! Every regex is compiled here so that a bad pattern fails the run before
//! any directory is created or command started.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ReconError, Result};
use crate::patterns::{Pattern, PatternDef};

pub const PORT_SCANS_FILE: &str = "port-scans.toml";
pub const SERVICE_SCANS_FILE: &str = "service-scans.toml";
pub const UNIVERSAL_PATTERNS_FILE: &str = "universal-patterns.toml";

/// Default config directory: `~/.config/host-recon`.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".config").join("host-recon"))
}

// ---- raw file shapes ----

#[derive(Debug, Deserialize)]
struct RawPrimaryScan {
    command: String,
    #[serde(default)]
    pattern: Vec<PatternDef>,
}

/// scan type -> scan name -> sub-scan name -> definition
type RawPortScans = BTreeMap<String, BTreeMap<String, BTreeMap<String, RawPrimaryScan>>>;

#[derive(Debug, Deserialize)]
struct RawServiceScans {
    username_wordlist: String,
    password_wordlist: String,
    #[serde(flatten)]
    rules: BTreeMap<String, RawServiceRule>,
}

#[derive(Debug, Deserialize)]
struct RawServiceRule {
    #[serde(rename = "service-names")]
    service_names: Vec<String>,
    #[serde(default)]
    manual: Vec<ManualEntry>,
    #[serde(default)]
    scan: Vec<RawSubScan>,
}

#[derive(Debug, Deserialize)]
struct RawSubScan {
    #[serde(default)]
    name: Option<String>,
    command: String,
    #[serde(default)]
    pattern: Vec<PatternDef>,
}

// ---- compiled shapes ----

/// One scan: a command template and the patterns to look for in its output.
#[derive(Debug, Clone)]
pub struct ScanDefinition {
    pub name: String,
    pub command: String,
    pub patterns: Vec<Pattern>,
}

/// A human-actionable follow-up suggested for a matched service.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ManualEntry {
    pub description: String,
    pub commands: Vec<String>,
}

/// Service-matching rule with its manual steps and secondary scans.
#[derive(Debug, Clone)]
pub struct ServiceRule {
    pub name: String,
    matcher: Regex,
    pub manual: Vec<ManualEntry>,
    pub scans: Vec<ScanDefinition>,
}

impl ServiceRule {
    /// Build a rule whose matcher is the alternation of `service_names`.
    pub fn new(
        name: impl Into<String>,
        service_names: &[String],
        manual: Vec<ManualEntry>,
        scans: Vec<ScanDefinition>,
    ) -> Result<Self> {
        let combined = format!("({})", service_names.join(")|("));
        let matcher = RegexBuilder::new(&combined)
            .case_insensitive(true)
            .build()
            .map_err(|e| ReconError::InvalidPattern {
                pattern: combined.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            name: name.into(),
            matcher,
            manual,
            scans,
        })
    }

    /// Whether a discovered service name satisfies this rule.
    pub fn matches(&self, service_name: &str) -> bool {
        self.matcher.is_match(&service_name.to_lowercase())
    }
}

/// Service rules plus the wordlists exposed to their templates.
#[derive(Debug, Clone)]
pub struct ServiceScans {
    pub username_wordlist: String,
    pub password_wordlist: String,
    pub rules: Vec<ServiceRule>,
}

/// Everything a run needs from the configuration directory.
#[derive(Debug, Clone)]
pub struct ReconConfig {
    /// Primary scans of the selected scan type.
    pub primary: Vec<ScanDefinition>,
    pub services: ServiceScans,
    pub universal: Vec<Pattern>,
}

impl ReconConfig {
    /// Load and compile the three configuration files from `dir`, keeping
    /// only the primary scans of `scan_type`.
    pub fn load(dir: &Path, scan_type: &str) -> Result<Self> {
        let port_path = dir.join(PORT_SCANS_FILE);
        let service_path = dir.join(SERVICE_SCANS_FILE);
        let universal_path = dir.join(UNIVERSAL_PATTERNS_FILE);
        for path in [&port_path, &service_path, &universal_path] {
            if !path.is_file() {
                return Err(ReconError::ConfigurationMissing { path: path.clone() });
            }
        }

        let config = Self::from_toml(
            &read(&port_path)?,
            &read(&service_path)?,
            &read(&universal_path)?,
            scan_type,
        )?;
        debug!(
            dir = %dir.display(),
            primary = config.primary.len(),
            rules = config.services.rules.len(),
            universal = config.universal.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(
        port_scans: &str,
        service_scans: &str,
        universal_patterns: &str,
        scan_type: &str,
    ) -> Result<Self> {
        let mut ports: RawPortScans = parse(port_scans, PORT_SCANS_FILE)?;
        let services: RawServiceScans = parse(service_scans, SERVICE_SCANS_FILE)?;
        let universal: BTreeMap<String, PatternDef> =
            parse(universal_patterns, UNIVERSAL_PATTERNS_FILE)?;

        let available = ports.keys().cloned().collect::<Vec<_>>().join(", ");
        let group = ports
            .remove(scan_type)
            .ok_or_else(|| ReconError::UnknownScanType {
                scan_type: scan_type.to_string(),
                available,
            })?;

        let mut primary = Vec::new();
        for (scan_name, sub_scans) in group {
            for (sub_name, raw) in sub_scans {
                primary.push(ScanDefinition {
                    name: format!("{scan_name}.{sub_name}"),
                    command: raw.command,
                    patterns: Pattern::compile_all(&raw.pattern)?,
                });
            }
        }

        let mut rules = Vec::new();
        for (rule_name, raw) in services.rules {
            let scans = raw
                .scan
                .into_iter()
                .enumerate()
                .map(|(i, s)| -> Result<ScanDefinition> {
                    Ok(ScanDefinition {
                        name: s.name.unwrap_or_else(|| format!("{rule_name}.{i}")),
                        command: s.command,
                        patterns: Pattern::compile_all(&s.pattern)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            rules.push(ServiceRule::new(
                rule_name.clone(),
                &raw.service_names,
                raw.manual,
                scans,
            )?);
        }

        let universal = universal
            .values()
            .map(Pattern::compile)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            primary,
            services: ServiceScans {
                username_wordlist: services.username_wordlist,
                password_wordlist: services.password_wordlist,
                rules,
            },
            universal,
        })
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| ReconError::ConfigParse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn parse<T: DeserializeOwned>(text: &str, file: &str) -> Result<T> {
    toml::from_str(text).map_err(|e| ReconError::ConfigParse {
        path: PathBuf::from(file),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PORTS: &str = r#"
        [default.nmap-quick.service-versions]
        command = "nmap {nmap_extra} -sV -oX {scandir}/xml/quick.xml {address}"

        [default.nmap-full.service-versions]
        command = "nmap {nmap_extra} -p- -sV -oX {scandir}/xml/full.xml {address}"

        [udp.nmap-top-20.service-versions]
        command = "nmap -sU --top-ports 20 -oX {scandir}/xml/udp.xml {address}"
        [[udp.nmap-top-20.service-versions.pattern]]
        description = "snmp open"
        pattern = "snmp"
    "#;

    const SERVICES: &str = r#"
        username_wordlist = "/usr/share/wordlists/users.txt"
        password_wordlist = "/usr/share/wordlists/passwords.txt"

        [http]
        service-names = ['^http', 'http-proxy']

        [[http.scan]]
        name = "whatweb"
        command = "whatweb {scheme}://{address}:{port} | tee {scandir}/{port}_whatweb.txt"
            [[http.scan.pattern]]
            description = "WordPress on {port}"
            pattern = "wordpress"

        [[http.manual]]
        description = "Directory brute force"
        commands = ["gobuster dir -u {scheme}://{address}:{port}/ -w {password_wordlist}"]

        [ssh]
        service-names = ['^ssh']
        [[ssh.manual]]
        description = "Brute force"
        commands = ["hydra -L {username_wordlist} -P {password_wordlist} ssh://{address}:{port}"]
    "#;

    const UNIVERSAL: &str = r#"
        [cve]
        description = "CVE reference: {match}"
        pattern = "cve-\\d{4}-\\d+"
    "#;

    #[test]
    fn parses_selected_scan_type() {
        let cfg = ReconConfig::from_toml(PORTS, SERVICES, UNIVERSAL, "default").unwrap();
        let names: Vec<_> = cfg.primary.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["nmap-full.service-versions", "nmap-quick.service-versions"]);
        assert!(cfg.primary.iter().all(|s| s.patterns.is_empty()));

        let udp = ReconConfig::from_toml(PORTS, SERVICES, UNIVERSAL, "udp").unwrap();
        assert_eq!(udp.primary.len(), 1);
        assert_eq!(udp.primary[0].patterns.len(), 1);
    }

    #[test]
    fn unknown_scan_type_lists_available() {
        let err = ReconConfig::from_toml(PORTS, SERVICES, UNIVERSAL, "quick").unwrap_err();
        match err {
            ReconError::UnknownScanType { available, .. } => assert_eq!(available, "default, udp"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parses_service_rules() {
        let cfg = ReconConfig::from_toml(PORTS, SERVICES, UNIVERSAL, "default").unwrap();
        assert_eq!(cfg.services.username_wordlist, "/usr/share/wordlists/users.txt");
        assert_eq!(cfg.services.rules.len(), 2);

        let http = &cfg.services.rules[0];
        assert_eq!(http.name, "http");
        assert_eq!(http.scans.len(), 1);
        assert_eq!(http.scans[0].name, "whatweb");
        assert_eq!(http.scans[0].patterns.len(), 1);
        assert_eq!(http.manual.len(), 1);

        assert!(http.matches("http"));
        assert!(http.matches("HTTP-Proxy"));
        assert!(!http.matches("ssh"));
        assert!(cfg.services.rules[1].matches("ssh"));
        assert_eq!(cfg.universal.len(), 1);
    }

    #[test]
    fn invalid_service_regex_is_fatal() {
        let services = r#"
            username_wordlist = "u"
            password_wordlist = "p"
            [broken]
            service-names = ['(http']
        "#;
        assert!(matches!(
            ReconConfig::from_toml(PORTS, services, UNIVERSAL, "default"),
            Err(ReconError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PORT_SCANS_FILE), PORTS).unwrap();
        std::fs::write(dir.path().join(SERVICE_SCANS_FILE), SERVICES).unwrap();
        match ReconConfig::load(dir.path(), "default").unwrap_err() {
            ReconError::ConfigurationMissing { path } => {
                assert!(path.ends_with(UNIVERSAL_PATTERNS_FILE))
            }
            other => panic!("unexpected error: {other}"),
        }

        std::fs::write(dir.path().join(UNIVERSAL_PATTERNS_FILE), UNIVERSAL).unwrap();
        assert!(ReconConfig::load(dir.path(), "default").is_ok());
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        assert!(matches!(
            ReconConfig::from_toml("[default", SERVICES, UNIVERSAL, "default"),
            Err(ReconError::ConfigParse { .. })
        ));
    }
}
