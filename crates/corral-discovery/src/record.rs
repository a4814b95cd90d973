use crate::DiscoveryError;
use serde::{Deserialize, Serialize};

/// DNS-SD service type advertised by every instance.
pub const SERVICE_TYPE: &str = "_corral._tcp.local";
pub const DEFAULT_ENDPOINT: &str = "/mcp";
const FALLBACK_INSTANCE: &str = "corral";
/// Longest note that fits one TXT string next to its `note=` key.
pub const MAX_NOTE_LEN: usize = 255 - "note=".len();

/// One peer as advertised on the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Sanitized `[a-z0-9-]+`; doubles as the namespace prefix for the
    /// peer's capabilities.
    pub instance: String,
    pub host: String,
    pub port: u16,
    pub endpoint: String,
    pub tls: bool,
    #[serde(default)]
    pub note: String,
}

impl PeerRecord {
    pub fn new(instance: &str, host: impl Into<String>, port: u16) -> Self {
        Self {
            instance: sanitize_instance_name(instance),
            host: host.into(),
            port,
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            tls: false,
            note: String::new(),
        }
    }

    /// Base URL of the peer's dispatch surface.
    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("{scheme}://{host}:{}{}", self.port, self.endpoint)
    }

    /// `<instance>._corral._tcp.local`
    pub fn service_name(&self) -> String {
        format!("{}.{SERVICE_TYPE}", self.instance)
    }

    /// `<instance>.local`
    pub fn host_name(&self) -> String {
        format!("{}.local", self.instance)
    }

    pub fn txt_entries(&self) -> Vec<String> {
        let mut entries = vec![
            format!("endpoint={}", self.endpoint),
            format!("tls={}", self.tls),
        ];
        if !self.note.is_empty() {
            entries.push(format!("note={}", truncate_note(&self.note)));
        }
        entries
    }

    /// Apply `key=value` TXT entries; unknown keys are ignored.
    pub fn apply_txt<'a>(&mut self, entries: impl IntoIterator<Item = &'a String>) {
        for entry in entries {
            if let Some(v) = entry.strip_prefix("note=") {
                v.clone_into(&mut self.note);
            } else if let Some(v) = entry.strip_prefix("endpoint=") {
                if !v.is_empty() {
                    v.clone_into(&mut self.endpoint);
                }
            } else if let Some(v) = entry.strip_prefix("tls=") {
                self.tls = v.eq_ignore_ascii_case("true");
            }
        }
    }
}

fn truncate_note(note: &str) -> &str {
    let mut end = note.len().min(MAX_NOTE_LEN);
    while !note.is_char_boundary(end) {
        end -= 1;
    }
    &note[..end]
}

/// Lowercase, map dots and spaces to `-`, drop anything outside `[a-z0-9-]`.
pub fn sanitize_instance_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | ' ' => '-',
            c => c.to_ascii_lowercase(),
        })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}

/// First label of a service instance name, sanitized:
/// `box._corral._tcp.local` gives `box`.
pub fn instance_from_service_name(name: &str) -> String {
    sanitize_instance_name(name.trim_end_matches('.').split('.').next().unwrap_or_default())
}

/// The host name, sanitized, or `corral` if it cannot be read.
pub fn default_instance_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .map(|h| sanitize_instance_name(&h.to_string_lossy()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_INSTANCE.to_owned())
}

/// Port of an address like `:8080` or `0.0.0.0:8080`.
pub fn parse_port(addr: &str) -> Result<u16, DiscoveryError> {
    let (_, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| DiscoveryError::InvalidAddress(addr.to_owned()))?;
    port.parse()
        .map_err(|_| DiscoveryError::InvalidAddress(addr.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_examples() {
        assert_eq!(sanitize_instance_name("My Laptop.local"), "my-laptop-local");
        assert_eq!(sanitize_instance_name("Büro_PC"), "bropc");
        assert_eq!(sanitize_instance_name("gpu-box-01"), "gpu-box-01");
    }

    #[test]
    fn url_scheme_follows_tls() {
        let mut rec = PeerRecord::new("gpu", "192.168.1.20", 8080);
        assert_eq!(rec.url(), "http://192.168.1.20:8080/mcp");
        rec.tls = true;
        rec.endpoint = "/rpc".into();
        assert_eq!(rec.url(), "https://192.168.1.20:8080/rpc");
        rec.host = "fe80::1".into();
        assert_eq!(rec.url(), "https://[fe80::1]:8080/rpc");
    }

    #[test]
    fn txt_entries_round_trip_through_apply() {
        let mut rec = PeerRecord::new("gpu", "h", 1);
        rec.note = "A100 box".into();
        rec.tls = true;
        let entries = rec.txt_entries();
        assert_eq!(entries.len(), 3);

        let mut parsed = PeerRecord::new("gpu", "h", 1);
        parsed.apply_txt(&entries);
        assert_eq!(parsed, rec);
    }

    #[test]
    fn long_note_is_cut_to_fit_a_txt_string() {
        let mut rec = PeerRecord::new("gpu", "h", 1);
        rec.note = "é".repeat(200);
        let note = rec.txt_entries().pop().unwrap();
        assert!(note.len() <= 255);
        assert!(note.starts_with("note=é"));
        assert_eq!(note.len(), "note=".len() + MAX_NOTE_LEN);
    }

    #[test]
    fn names_derived_from_instance() {
        let rec = PeerRecord::new("Box", "h", 1);
        assert_eq!(rec.service_name(), "box._corral._tcp.local");
        assert_eq!(rec.host_name(), "box.local");
        assert_eq!(instance_from_service_name("Box._corral._tcp.local."), "box");
    }

    #[test]
    fn port_parsing() {
        assert_eq!(parse_port(":8080").unwrap(), 8080);
        assert_eq!(parse_port("0.0.0.0:9000").unwrap(), 9000);
        assert!(parse_port("localhost").is_err());
        assert!(parse_port("host:http").is_err());
    }

    #[test]
    fn default_name_is_sanitized() {
        let name = default_instance_name();
        assert!(!name.is_empty());
        assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }
}
