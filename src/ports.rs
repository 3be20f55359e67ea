use crate::error::{ReconError, Result};

/// A port or inclusive port range from a `--ports` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    Single(u16),
    Range(u16, u16),
}

/// Parse a port list such as `22,80,8000-8010` into its items.
///
/// Supported formats:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - items separated by commas and/or whitespace
/// - duplicate single ports are dropped, first occurrence wins
pub fn parse_ports_str(s: &str) -> Result<Vec<PortSpec>> {
    let invalid = |reason: String| ReconError::InvalidPorts {
        input: s.to_string(),
        reason,
    };

    let mut out: Vec<PortSpec> = Vec::new();
    for item in s
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|i| !i.is_empty())
    {
        let spec = if let Some((a, b)) = item.split_once('-') {
            let start = parse_port_str(a.trim())
                .map_err(|e| invalid(format!("invalid start in range {item}: {e}")))?;
            let end = parse_port_str(b.trim())
                .map_err(|e| invalid(format!("invalid end in range {item}: {e}")))?;
            if start > end {
                return Err(invalid(format!("invalid range {start}-{end} (start > end)")));
            }
            PortSpec::Range(start, end)
        } else {
            PortSpec::Single(
                parse_port_str(item).map_err(|e| invalid(format!("invalid port {item}: {e}")))?,
            )
        };
        if !out.contains(&spec) {
            out.push(spec);
        }
    }

    if out.is_empty() {
        return Err(invalid("no ports given".into()));
    }
    Ok(out)
}

/// Validate a `--ports` value and return it in canonical `a,b,c-d` form.
///
/// The literal `-` (every port) is passed through unchanged.
pub fn normalize_ports(s: &str) -> Result<String> {
    if s.trim() == "-" {
        return Ok("-".to_string());
    }
    let specs = parse_ports_str(s)?;
    Ok(specs
        .iter()
        .map(|p| match p {
            PortSpec::Single(p) => p.to_string(),
            PortSpec::Range(a, b) => format!("{a}-{b}"),
        })
        .collect::<Vec<_>>()
        .join(","))
}

fn parse_port_str(s: &str) -> std::result::Result<u16, String> {
    let val: u32 = s.parse::<u32>().map_err(|e| e.to_string())?;
    if val == 0 || val > 65535 {
        return Err(format!("port out of range: {val}"));
    }
    Ok(val as u16)
}
