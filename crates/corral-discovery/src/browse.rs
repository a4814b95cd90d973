use crate::announce::{MDNS_GROUP, MDNS_PORT};
use crate::dns::{names_equal, Message, RecordData, TYPE_PTR};
use crate::record::{instance_from_service_name, PeerRecord, DEFAULT_ENDPOINT, SERVICE_TYPE};
use crate::DiscoveryError;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const RECV_SLICE: Duration = Duration::from_millis(100);
const ERROR_BACKOFF: Duration = Duration::from_millis(20);

/// Cooperative cancellation for a running `discover` call.
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One-shot browser for `_corral._tcp.local` instances.
///
/// Queries go out from an ephemeral port, so responders answer by unicast
/// and the browser never needs to join the multicast group.
#[derive(Debug, Clone)]
pub struct Browser {
    target: SocketAddr,
    bind: SocketAddrV4,
}

impl Default for Browser {
    fn default() -> Self {
        Self {
            target: SocketAddr::from((MDNS_GROUP, MDNS_PORT)),
            bind: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        }
    }
}

impl Browser {
    /// Send the query to `target` instead of the mDNS group.
    pub fn with_target(target: SocketAddr) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }

    /// Collect peers for up to `timeout`, or until `cancel` fires.
    ///
    /// A failure to send the query is returned at once. Receive errors are
    /// only surfaced when they leave the result empty.
    pub fn discover(
        &self,
        timeout: Duration,
        cancel: &Cancel,
    ) -> Result<Vec<PeerRecord>, DiscoveryError> {
        let socket = UdpSocket::bind(self.bind)?;
        let query = Message::query(SERVICE_TYPE, TYPE_PTR).encode()?;
        socket.send_to(&query, self.target)?;
        debug!("sent PTR query for {SERVICE_TYPE} to {}", self.target);

        let deadline = Instant::now() + timeout;
        let mut collector = Collector::default();
        let mut last_error = None;
        let mut buf = [0u8; 9000];

        while !cancel.is_cancelled() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            socket.set_read_timeout(Some(remaining.min(RECV_SLICE)))?;
            match socket.recv_from(&mut buf) {
                Ok((len, src)) => match Message::decode(&buf[..len]) {
                    Ok(msg) if msg.is_response() => collector.ingest(&msg, src.ip()),
                    Ok(_) => {}
                    Err(e) => debug!("ignoring malformed response from {src}: {e}"),
                },
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => {
                    debug!("receive error during discovery: {e}");
                    last_error = Some(e);
                    std::thread::sleep(ERROR_BACKOFF);
                }
            }
        }

        let peers = collector.finish();
        if peers.is_empty() {
            if let Some(e) = last_error {
                return Err(e.into());
            }
        }
        info!("discovered {} peer(s)", peers.len());
        Ok(peers)
    }
}

/// Folds response packets into one record per instance, keeping first-seen
/// order.
#[derive(Debug, Default)]
pub(crate) struct Collector {
    peers: Vec<PeerRecord>,
}

impl Collector {
    /// One packet may describe several instances (shared responders); each
    /// PTR target and SRV/TXT owner is keyed by its instance name.
    pub(crate) fn ingest(&mut self, msg: &Message, source: IpAddr) {
        let mut found: Vec<PeerRecord> = Vec::new();

        for record in msg.records() {
            if !contains_service(&record.name) {
                continue;
            }
            let owner = match &record.data {
                RecordData::Ptr(target) if contains_service(target) => target,
                RecordData::Srv { .. } | RecordData::Txt(_) => &record.name,
                _ => continue,
            };
            if names_equal(owner, SERVICE_TYPE) {
                continue;
            }
            let instance = instance_from_service_name(owner);
            if instance.is_empty() {
                continue;
            }

            let idx = match found.iter().position(|p| p.instance == instance) {
                Some(idx) => idx,
                None => {
                    found.push(PeerRecord {
                        instance,
                        host: source.to_string(),
                        port: 0,
                        endpoint: DEFAULT_ENDPOINT.to_owned(),
                        tls: false,
                        note: String::new(),
                    });
                    found.len() - 1
                }
            };
            match &record.data {
                RecordData::Srv { port, .. } => found[idx].port = *port,
                RecordData::Txt(entries) => found[idx].apply_txt(entries),
                _ => {}
            }
        }

        for peer in found {
            self.merge(peer);
        }
    }

    fn merge(&mut self, peer: PeerRecord) {
        match self.peers.iter_mut().find(|p| p.instance == peer.instance) {
            Some(existing) => {
                if existing.note.is_empty() && !peer.note.is_empty() {
                    existing.note = peer.note;
                }
                if existing.port == 0 && peer.port != 0 {
                    existing.port = peer.port;
                }
            }
            None => self.peers.push(peer),
        }
    }

    /// Drop entries that never learned a port or host.
    pub(crate) fn finish(self) -> Vec<PeerRecord> {
        self.peers
            .into_iter()
            .filter(|p| p.port > 0 && !p.host.is_empty())
            .collect()
    }
}

fn contains_service(name: &str) -> bool {
    name.to_ascii_lowercase().contains(SERVICE_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::Record;

    fn response(instance: &str, port: u16, txt: &[&str]) -> Message {
        let service = format!("{instance}.{SERVICE_TYPE}");
        let mut msg = Message::response(0);
        msg.answers
            .push(Record::new(SERVICE_TYPE, 120, RecordData::Ptr(service.clone())));
        if port > 0 {
            msg.additionals.push(Record::new(
                service.clone(),
                120,
                RecordData::Srv {
                    priority: 0,
                    weight: 0,
                    port,
                    target: format!("{instance}.local"),
                },
            ));
        }
        if !txt.is_empty() {
            msg.additionals.push(Record::new(
                service,
                120,
                RecordData::Txt(txt.iter().map(|s| (*s).to_owned()).collect()),
            ));
        }
        msg
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn full_response_yields_peer_from_source_address() {
        let mut c = Collector::default();
        c.ingest(
            &response("gpu", 8080, &["note=A100", "endpoint=/rpc", "tls=true"]),
            ip(5),
        );
        let peers = c.finish();
        assert_eq!(peers.len(), 1);
        let p = &peers[0];
        assert_eq!(p.instance, "gpu");
        assert_eq!(p.host, "10.0.0.5");
        assert_eq!(p.port, 8080);
        assert_eq!(p.note, "A100");
        assert_eq!(p.url(), "https://10.0.0.5:8080/rpc");
    }

    #[test]
    fn duplicates_backfill_missing_fields_only() {
        let mut c = Collector::default();
        c.ingest(&response("gpu", 0, &[]), ip(5));
        c.ingest(&response("gpu", 8080, &["note=first"]), ip(6));
        c.ingest(&response("gpu", 9090, &["note=second"]), ip(7));
        let peers = c.finish();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port, 8080);
        assert_eq!(peers[0].note, "first");
        assert_eq!(peers[0].host, "10.0.0.5");
    }

    #[test]
    fn portless_entries_are_dropped_and_order_is_kept() {
        let mut c = Collector::default();
        c.ingest(&response("b", 2, &[]), ip(2));
        c.ingest(&response("nope", 0, &[]), ip(3));
        c.ingest(&response("a", 1, &[]), ip(1));
        let names: Vec<_> = c.finish().into_iter().map(|p| p.instance).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn one_packet_with_two_instances_yields_two_peers() {
        let mut msg = response("gpu", 8080, &["note=A100"]);
        let other = response("cpu", 9090, &["note=spare", "tls=true"]);
        msg.answers.extend(other.answers);
        msg.additionals.extend(other.additionals);

        // Through the wire format, as a shared responder would send it.
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        let mut c = Collector::default();
        c.ingest(&decoded, ip(4));
        let peers = c.finish();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].instance, "gpu");
        assert_eq!(peers[0].port, 8080);
        assert_eq!(peers[0].note, "A100");
        assert!(!peers[0].tls);
        assert_eq!(peers[1].instance, "cpu");
        assert_eq!(peers[1].port, 9090);
        assert_eq!(peers[1].note, "spare");
        assert!(peers[1].tls);
    }

    #[test]
    fn foreign_services_are_ignored() {
        let mut msg = Message::response(0);
        msg.answers.push(Record::new(
            "_http._tcp.local",
            120,
            RecordData::Ptr("web._http._tcp.local".into()),
        ));
        let mut c = Collector::default();
        c.ingest(&msg, ip(1));
        assert!(c.finish().is_empty());
    }

    #[test]
    fn cancelled_discover_returns_promptly() {
        let cancel = Cancel::new();
        cancel.cancel();
        let browser = Browser::with_target("127.0.0.1:9".parse().unwrap());
        let start = Instant::now();
        let peers = browser.discover(Duration::from_secs(5), &cancel).unwrap();
        assert!(peers.is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
