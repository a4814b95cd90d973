use crate::dns::{
    names_equal, Message, Question, Record, RecordData, TYPE_A, TYPE_ANY, TYPE_PTR, TYPE_SRV,
    TYPE_TXT,
};
use crate::interfaces::advertised_addresses;
use crate::record::{PeerRecord, SERVICE_TYPE};
use crate::DiscoveryError;
use nix::sys::socket::{
    bind, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn,
};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;
const SERVICES_META: &str = "_services._dns-sd._udp.local";
const DEFAULT_TTL: u32 = 120;
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct AnnouncerConfig {
    pub bind: SocketAddrV4,
    /// Join the mDNS group with address reuse on the bound socket.
    pub multicast: bool,
    /// Where unsolicited announcements and goodbyes go; `None` sends none.
    pub announce_target: Option<SocketAddr>,
    /// Addresses for A records; `None` uses the filtered interface list.
    pub addresses: Option<Vec<Ipv4Addr>>,
    pub ttl: u32,
}

impl Default for AnnouncerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT),
            multicast: true,
            announce_target: Some(SocketAddr::from((MDNS_GROUP, MDNS_PORT))),
            addresses: None,
            ttl: DEFAULT_TTL,
        }
    }
}

impl AnnouncerConfig {
    /// Plain unicast responder on an ephemeral loopback port.
    pub fn loopback() -> Self {
        Self {
            bind: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            multicast: false,
            announce_target: None,
            addresses: Some(vec![Ipv4Addr::LOCALHOST]),
            ttl: DEFAULT_TTL,
        }
    }
}

/// Builds the record set for one advertised instance and answers queries
/// against it.
#[derive(Debug, Clone)]
pub(crate) struct Responder {
    record: PeerRecord,
    addresses: Vec<Ipv4Addr>,
    ttl: u32,
}

impl Responder {
    pub(crate) fn new(record: PeerRecord, addresses: Vec<Ipv4Addr>, ttl: u32) -> Self {
        Self {
            record,
            addresses,
            ttl,
        }
    }

    fn ptr(&self, ttl: u32) -> Record {
        Record::new(SERVICE_TYPE, ttl, RecordData::Ptr(self.record.service_name()))
    }

    fn srv(&self, ttl: u32) -> Record {
        Record::new(
            self.record.service_name(),
            ttl,
            RecordData::Srv {
                priority: 0,
                weight: 0,
                port: self.record.port,
                target: self.record.host_name(),
            },
        )
        .unique()
    }

    fn txt(&self, ttl: u32) -> Record {
        Record::new(
            self.record.service_name(),
            ttl,
            RecordData::Txt(self.record.txt_entries()),
        )
        .unique()
    }

    fn a_records(&self, ttl: u32) -> impl Iterator<Item = Record> + '_ {
        let host = self.record.host_name();
        self.addresses
            .iter()
            .map(move |ip| Record::new(host.clone(), ttl, RecordData::A(*ip)).unique())
    }

    /// Unsolicited announcement, or a goodbye when `ttl` is zero.
    pub(crate) fn announcement(&self, ttl: u32) -> Message {
        let mut msg = Message::response(0);
        msg.answers.push(self.ptr(ttl));
        msg.answers.push(self.srv(ttl));
        msg.answers.push(self.txt(ttl));
        msg.answers.extend(self.a_records(ttl));
        msg
    }

    /// Response to `query`, or `None` when no question concerns us.
    pub(crate) fn answer(&self, query: &Message) -> Option<Message> {
        let ttl = self.ttl;
        let service = self.record.service_name();
        let host = self.record.host_name();
        let mut msg = Message::response(0);

        for q in &query.questions {
            let wants = |t: u16| q.qtype == t || q.qtype == TYPE_ANY;
            if names_equal(&q.name, SERVICE_TYPE) && wants(TYPE_PTR) {
                push_unique(&mut msg.answers, self.ptr(ttl));
                push_unique(&mut msg.additionals, self.srv(ttl));
                push_unique(&mut msg.additionals, self.txt(ttl));
                for a in self.a_records(ttl) {
                    push_unique(&mut msg.additionals, a);
                }
            } else if names_equal(&q.name, &service) {
                if wants(TYPE_SRV) {
                    push_unique(&mut msg.answers, self.srv(ttl));
                    for a in self.a_records(ttl) {
                        push_unique(&mut msg.additionals, a);
                    }
                }
                if wants(TYPE_TXT) {
                    push_unique(&mut msg.answers, self.txt(ttl));
                }
            } else if names_equal(&q.name, &host) && wants(TYPE_A) {
                for a in self.a_records(ttl) {
                    push_unique(&mut msg.answers, a);
                }
            } else if names_equal(&q.name, SERVICES_META) && wants(TYPE_PTR) {
                push_unique(
                    &mut msg.answers,
                    Record::new(SERVICES_META, ttl, RecordData::Ptr(SERVICE_TYPE.to_owned())),
                );
            }
        }

        if msg.answers.is_empty() {
            return None;
        }
        // Additionals already present as answers are redundant.
        let answers = msg.answers.clone();
        msg.additionals.retain(|r| !answers.contains(r));
        Some(msg)
    }
}

fn push_unique(records: &mut Vec<Record>, record: Record) {
    if !records.contains(&record) {
        records.push(record);
    }
}

struct Running {
    socket: Arc<UdpSocket>,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    local: SocketAddr,
}

/// Advertises one `PeerRecord` and answers queries for it until stopped.
pub struct Announcer {
    responder: Responder,
    config: AnnouncerConfig,
    running: Mutex<Option<Running>>,
}

impl Announcer {
    pub fn new(record: PeerRecord, config: AnnouncerConfig) -> Self {
        let addresses = config
            .addresses
            .clone()
            .unwrap_or_else(advertised_addresses);
        Self {
            responder: Responder::new(record, addresses, config.ttl),
            config,
            running: Mutex::new(None),
        }
    }

    pub fn record(&self) -> &PeerRecord {
        &self.responder.record
    }

    /// Bind, announce and start answering. Returns the bound address.
    /// Calling it again while running is a no-op.
    pub fn start(&self) -> Result<SocketAddr, DiscoveryError> {
        let mut running = self.running.lock();
        if let Some(r) = running.as_ref() {
            return Ok(r.local);
        }

        let socket = open_socket(&self.config)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local = socket.local_addr()?;
        let socket = Arc::new(socket);

        if let Some(target) = self.config.announce_target {
            let bytes = self.responder.announcement(self.config.ttl).encode()?;
            if let Err(e) = socket.send_to(&bytes, target) {
                warn!("initial announcement to {target} failed: {e}");
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let socket = Arc::clone(&socket);
            let stop = Arc::clone(&stop);
            let responder = self.responder.clone();
            let target = self.config.announce_target;
            std::thread::Builder::new()
                .name("corral-mdns".into())
                .spawn(move || serve(&socket, &responder, target, &stop))?
        };

        info!(
            "announcing {} on {local} (port {})",
            self.responder.record.service_name(),
            self.responder.record.port
        );
        *running = Some(Running {
            socket,
            stop,
            thread,
            local,
        });
        Ok(local)
    }

    /// Send a goodbye and stop answering. Idempotent.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.stop.store(true, Ordering::SeqCst);
        if let Some(target) = self.config.announce_target {
            match self.responder.announcement(0).encode() {
                Ok(bytes) => {
                    if let Err(e) = running.socket.send_to(&bytes, target) {
                        debug!("goodbye to {target} failed: {e}");
                    }
                }
                Err(e) => warn!("failed to encode goodbye: {e}"),
            }
        }
        if running.thread.join().is_err() {
            warn!("mDNS responder thread panicked");
        }
        info!("stopped announcing {}", self.responder.record.service_name());
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local)
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_socket(config: &AnnouncerConfig) -> Result<UdpSocket, DiscoveryError> {
    if !config.multicast {
        return Ok(UdpSocket::bind(config.bind)?);
    }
    let fd = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )?;
    setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    setsockopt(&fd, sockopt::ReusePort, &true)?;
    bind(fd.as_raw_fd(), &SockaddrIn::from(config.bind))?;
    let socket = UdpSocket::from(fd);
    socket.join_multicast_v4(&MDNS_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    Ok(socket)
}

fn serve(
    socket: &UdpSocket,
    responder: &Responder,
    multicast_target: Option<SocketAddr>,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; 9000];
    while !stop.load(Ordering::SeqCst) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                debug!("mDNS receive error: {e}");
                continue;
            }
        };
        let query = match Message::decode(&buf[..len]) {
            Ok(m) if !m.is_response() => m,
            Ok(_) => continue,
            Err(e) => {
                debug!("ignoring malformed packet from {src}: {e}");
                continue;
            }
        };
        let Some(mut reply) = responder.answer(&query) else {
            continue;
        };

        // Legacy resolvers (source port other than 5353) and QU questions
        // get a direct reply carrying the query id and questions.
        let unicast = src.port() != MDNS_PORT || query.questions.iter().any(|q| q.unicast_response);
        let dest = if unicast {
            reply.id = query.id;
            reply.questions = query
                .questions
                .iter()
                .map(|q| Question {
                    unicast_response: false,
                    ..q.clone()
                })
                .collect();
            src
        } else {
            multicast_target.unwrap_or(src)
        };

        match reply.encode() {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, dest) {
                    debug!("reply to {dest} failed: {e}");
                }
            }
            Err(e) => warn!("failed to encode reply: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responder() -> Responder {
        let mut rec = PeerRecord::new("gpu-box", "192.168.1.9", 8080);
        rec.note = "A100".into();
        Responder::new(rec, vec![Ipv4Addr::new(192, 168, 1, 9)], 120)
    }

    #[test]
    fn ptr_query_gets_full_record_set() {
        let reply = responder()
            .answer(&Message::query(SERVICE_TYPE, TYPE_PTR))
            .unwrap();
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(
            reply.answers[0].data,
            RecordData::Ptr("gpu-box._corral._tcp.local".into())
        );
        let types: Vec<u16> = reply.additionals.iter().map(Record::rtype).collect();
        assert_eq!(types, vec![TYPE_SRV, TYPE_TXT, TYPE_A]);
    }

    #[test]
    fn instance_and_host_queries() {
        let r = responder();
        let srv = r
            .answer(&Message::query("gpu-box._corral._tcp.local", TYPE_SRV))
            .unwrap();
        assert!(matches!(srv.answers[0].data, RecordData::Srv { port: 8080, .. }));

        let any = r
            .answer(&Message::query("GPU-BOX._corral._tcp.local.", TYPE_ANY))
            .unwrap();
        assert_eq!(any.answers.len(), 2);

        let a = r.answer(&Message::query("gpu-box.local", TYPE_A)).unwrap();
        assert_eq!(
            a.answers[0].data,
            RecordData::A(Ipv4Addr::new(192, 168, 1, 9))
        );
    }

    #[test]
    fn unrelated_queries_are_ignored() {
        let r = responder();
        assert!(r.answer(&Message::query("_http._tcp.local", TYPE_PTR)).is_none());
        assert!(r.answer(&Message::query(SERVICE_TYPE, TYPE_A)).is_none());
    }

    #[test]
    fn goodbye_has_zero_ttl() {
        let msg = responder().announcement(0);
        assert!(msg.is_response());
        assert_eq!(msg.answers.len(), 4);
        assert!(msg.answers.iter().all(|r| r.ttl == 0));
    }

    #[test]
    fn oversized_note_still_encodes() {
        let mut rec = PeerRecord::new("gpu-box", "192.168.1.9", 8080);
        rec.note = "x".repeat(400);
        let r = Responder::new(rec, vec![Ipv4Addr::new(192, 168, 1, 9)], 120);
        assert!(r.announcement(120).encode().is_ok());
    }

    #[test]
    fn loopback_start_stop_is_idempotent() {
        let rec = PeerRecord::new("lo-test", "127.0.0.1", 9000);
        let announcer = Announcer::new(rec, AnnouncerConfig::loopback());
        let first = announcer.start().unwrap();
        assert_eq!(announcer.start().unwrap(), first);
        assert!(announcer.is_running());
        announcer.stop();
        announcer.stop();
        assert!(!announcer.is_running());
        assert!(announcer.local_addr().is_none());
    }
}
