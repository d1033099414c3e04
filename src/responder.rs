//! Responder daemon claiming and defending a `.local.` hostname.

// How the hostname claim works in a nutshell:
//
// (per RFC 6762 section 8.1, simplified to the upstream behavior)
// Before answering queries for a name, the responder probes the network:
// it multicasts a query for the candidate name and waits a short window.
// If some other host answers with a live (nonzero-TTL) address record for
// that name, the name is taken: the responder appends a numeric suffix
// ("laptop-2.local.") and probes again. A window with no such answer
// confirms the name, after which queries for it are answered with address
// records picked per querier: the interface whose subnet contains the
// querier's source address provides the answer.
//
// Naming conventions in this source code:
//
// `local_name` is the bare machine name, e.g. `laptop`.
// `hostname` is the dot-terminated mDNS name, e.g. `laptop-2.local.`.

use crate::dns_parser::{
    ip_address_rr_type, DnsAddress, DnsIncoming, DnsOutgoing, RRType, CLASS_CACHE_FLUSH, CLASS_IN,
    FLAGS_AA, FLAGS_QR_QUERY, FLAGS_QR_RESPONSE, MAX_MSG_ABSOLUTE,
};
use crate::error::{Error, Result};
use crate::log::{debug, trace};
use crate::Receiver;
use flume::{bounded, Sender, TrySendError};
use if_addrs::IfAddr;
use mio::{net::UdpSocket as MioUdpSocket, Poll};
use socket2::Socket;
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket},
    thread,
    time::{Duration, SystemTime},
};

/// A simple macro to report all kinds of errors.
macro_rules! e_fmt {
  ($($arg:tt)+) => {
      Error::Msg(format!($($arg)+))
  };
}

const MDNS_PORT: u16 = 5353;
const GROUP_ADDR_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const GROUP_ADDR_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);
const LOOPBACK_V4: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Default TTL for our address records, in seconds.
const HOST_TTL: u32 = 3600;

/// How long a candidate name must stay unchallenged before it is confirmed.
const PROBE_WAIT_MILLIS: u64 = 2000;

/// How often sockets are (re)bound and multicast groups (re)joined.
///
/// This is the sole recovery mechanism for interfaces that appear,
/// disappear or flap, and for earlier bind failures.
const REBIND_INTERVAL_MILLIS: u64 = 60_000;

/// Default cap for the rename suffix before the claimer gives up.
const MAX_SUFFIX_DEFAULT: u32 = 100;

// Poll tokens are fixed at registration time: the event handler never has
// to recover "which socket fired" from the event source itself.
const SIGNAL_SOCK_EVENT_KEY: usize = usize::MAX - 1;
const SOCK_EVENT_KEY_V4: usize = 0;
const SOCK_EVENT_KEY_V6: usize = 1;

/// The IP family of a socket or datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "IPv4"),
            Self::V6 => write!(f, "IPv6"),
        }
    }
}

/// Status code for the responder daemon.
#[derive(Debug, PartialEq, Clone, Eq)]
#[non_exhaustive]
pub enum ResponderStatus {
    /// The daemon is running as normal.
    Running,

    /// The daemon has been shutdown.
    Shutdown,
}

/// A snapshot of the hostname claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostnameStatus {
    /// The current candidate (or confirmed) hostname, dot-terminated.
    pub name: String,

    /// Whether the probe window elapsed without a challenge.
    ///
    /// Once true, `name` never changes for the process lifetime.
    pub confirmed: bool,
}

/// Some notable events from the daemon. Expected to happen infrequently.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ResponderEvent {
    /// A family socket was bound to the mDNS port.
    Bound(IpFamily),

    /// Daemon encountered an error, e.g. a socket failed to bind.
    Error(Error),

    /// The candidate hostname was already claimed on the network and
    /// was renamed.
    HostnameChange {
        /// The conflicting candidate.
        from: String,
        /// The new candidate being probed.
        to: String,
    },

    /// The probe window elapsed without a challenge; the hostname is final.
    HostnameConfirmed(String),
}

/// Tunables of the responder. A single immutable value passed at creation.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// UDP port for all mDNS traffic.
    pub port: u16,

    /// IPv4 multicast group address.
    pub group_v4: Ipv4Addr,

    /// IPv6 multicast group address.
    pub group_v6: Ipv6Addr,

    /// TTL of the address records we answer with, in seconds.
    pub host_ttl: u32,

    /// Probe window: how long a candidate must stay unchallenged.
    pub probe_wait_millis: u64,

    /// Interval of the bind/rejoin maintenance pass.
    pub rebind_interval_millis: u64,

    /// Highest rename suffix before the claimer reports an error and
    /// stops probing. The upstream implementation renames forever; a
    /// persistent conflicting responder would keep it looping, so the
    /// counter is capped here.
    pub max_suffix: u32,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            port: MDNS_PORT,
            group_v4: GROUP_ADDR_V4,
            group_v6: GROUP_ADDR_V6,
            host_ttl: HOST_TTL,
            probe_wait_millis: PROBE_WAIT_MILLIS,
            rebind_interval_millis: REBIND_INTERVAL_MILLIS,
            max_suffix: MAX_SUFFIX_DEFAULT,
        }
    }
}

/// A daemon thread for the mDNS host responder.
///
/// This struct provides a handle and an API to the daemon. It is cloneable.
#[derive(Clone)]
pub struct HostResponder {
    /// Sender handle of the channel to the daemon.
    sender: Sender<Command>,

    /// Send to this addr to signal that a `Command` is coming.
    ///
    /// The daemon listens on this addr together with the mDNS sockets,
    /// to avoid busy polling the flume channel.
    signal_addr: SocketAddr,
}

impl HostResponder {
    /// Creates a new responder with the default configuration and spawns
    /// a thread to run the daemon.
    ///
    /// The daemon (re)uses the default mDNS port 5353.
    pub fn new() -> Result<Self> {
        Self::with_config(ResponderConfig::default())
    }

    /// Creates a new responder with `config` and spawns its daemon thread.
    pub fn with_config(config: ResponderConfig) -> Result<Self> {
        // Use port 0 to allow the system assign a random available port,
        // no need for a pre-defined port number.
        let signal_addr = SocketAddrV4::new(LOOPBACK_V4, 0);

        let signal_sock = UdpSocket::bind(signal_addr)
            .map_err(|e| e_fmt!("failed to create signal_sock for daemon: {}", e))?;

        // Get the socket with the OS chosen port
        let signal_addr = signal_sock
            .local_addr()
            .map_err(|e| e_fmt!("failed to get signal sock addr: {}", e))?;

        // Must be nonblocking so we can listen to it together with mDNS sockets.
        signal_sock
            .set_nonblocking(true)
            .map_err(|e| e_fmt!("failed to set nonblocking for signal socket: {}", e))?;

        let poller = Poll::new().map_err(|e| e_fmt!("failed to create mio Poll: {e}"))?;

        let (sender, receiver) = bounded(100);

        // Spawn the daemon thread
        let mio_sock = MioUdpSocket::from_std(signal_sock);
        thread::Builder::new()
            .name("mDNS_host_responder".to_string())
            .spawn(move || Self::daemon_thread(config, mio_sock, poller, receiver))
            .map_err(|e| e_fmt!("thread builder failed to spawn: {}", e))?;

        Ok(Self {
            sender,
            signal_addr,
        })
    }

    /// Sends `cmd` to the daemon via its channel, and sends a signal
    /// to its sock addr to notify.
    fn send_cmd(&self, cmd: Command) -> Result<()> {
        let cmd_name = cmd.to_string();

        // First, send to the flume channel.
        self.sender.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => Error::Again,
            e => e_fmt!("flume::channel::send failed: {}", e),
        })?;

        // Second, send a signal to notify the daemon.
        let addr = SocketAddrV4::new(LOOPBACK_V4, 0);
        let socket = UdpSocket::bind(addr)
            .map_err(|e| e_fmt!("Failed to create socket to send signal: {}", e))?;
        socket
            .send_to(cmd_name.as_bytes(), self.signal_addr)
            .map_err(|e| {
                e_fmt!(
                    "signal socket send_to {} ({}) failed: {}",
                    self.signal_addr,
                    cmd_name,
                    e
                )
            })?;

        Ok(())
    }

    /// Returns a channel receiver for the current hostname claim.
    ///
    /// The caller can call `.recv_async().await` on this receiver in an
    /// async environment or call `.recv()` in a sync environment.
    pub fn hostname(&self) -> Result<Receiver<HostnameStatus>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::GetHostname(resp_s))?;
        Ok(resp_r)
    }

    /// Starts to monitor events from the daemon.
    ///
    /// Returns a channel [`Receiver`] of [`ResponderEvent`].
    pub fn monitor(&self) -> Result<Receiver<ResponderEvent>> {
        let (resp_s, resp_r) = bounded(100);
        self.send_cmd(Command::Monitor(resp_s))?;
        Ok(resp_r)
    }

    /// Returns the status of the daemon.
    ///
    /// When an error is returned, the caller should retry only when
    /// the error is `Error::Again`, otherwise should consider the daemon
    /// stopped working and move on.
    pub fn status(&self) -> Result<Receiver<ResponderStatus>> {
        let (resp_s, resp_r) = bounded(1);

        if self.sender.is_disconnected() {
            resp_s
                .send(ResponderStatus::Shutdown)
                .map_err(|e| e_fmt!("failed to send responder status to the client: {}", e))?;
        } else {
            self.send_cmd(Command::GetStatus(resp_s))?;
        }

        Ok(resp_r)
    }

    /// Shuts down the daemon thread and returns a channel to receive the status.
    ///
    /// When an error is returned, the caller should retry only when
    /// the error is `Error::Again`, otherwise should log and move on.
    pub fn shutdown(&self) -> Result<Receiver<ResponderStatus>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::Exit(resp_s))?;
        Ok(resp_r)
    }

    fn daemon_thread(
        config: ResponderConfig,
        signal_sock: MioUdpSocket,
        poller: Poll,
        receiver: Receiver<Command>,
    ) {
        let responder = Responder::new(config, signal_sock, poller);

        if let Some(cmd) = Self::run(responder, receiver) {
            match cmd {
                Command::Exit(resp_s) => {
                    if let Err(e) = resp_s.send(ResponderStatus::Shutdown) {
                        debug!("exit: failed to send response of shutdown: {}", e);
                    }
                }
                _ => {
                    debug!("Unexpected command: {:?}", cmd);
                }
            }
        }
    }

    fn handle_poller_events(r: &mut Responder, events: &mio::Events) {
        for ev in events.iter() {
            trace!("event received with key {:?}", ev.token());
            match ev.token().0 {
                SIGNAL_SOCK_EVENT_KEY => {
                    // Drain signals as we will drain commands as well.
                    r.signal_sock_drain();

                    if let Err(e) = r.poller.registry().reregister(
                        &mut r.signal_sock,
                        ev.token(),
                        mio::Interest::READABLE,
                    ) {
                        debug!("failed to modify poller for signal socket: {}", e);
                    }
                }
                SOCK_EVENT_KEY_V4 => {
                    // Read until no more packets available.
                    while r.handle_read(IpFamily::V4) {}
                    r.reregister_family(IpFamily::V4, ev.token());
                }
                SOCK_EVENT_KEY_V6 => {
                    while r.handle_read(IpFamily::V6) {}
                    r.reregister_family(IpFamily::V6, ev.token());
                }
                key => debug!("unknown event key {}", key),
            }
        }
    }

    /// The main event loop of the daemon thread
    ///
    /// In each round, it will:
    /// 1. select the listening sockets with a timeout up to the earliest timer.
    /// 2. process the incoming packets if any.
    /// 3. fire the probe / rebind timers that came due.
    /// 4. try_recv on its channel and execute commands.
    fn run(mut r: Responder, receiver: Receiver<Command>) -> Option<Command> {
        // Add the daemon's signal socket to the poller.
        if let Err(e) = r.poller.registry().register(
            &mut r.signal_sock,
            mio::Token(SIGNAL_SOCK_EVENT_KEY),
            mio::Interest::READABLE,
        ) {
            debug!("failed to add signal socket to the poller: {}", e);
            return None;
        }

        // First maintenance pass: bind sockets, join groups, start probing.
        r.rebind_pass(current_time_millis());

        // Start the run loop.

        let mut events = mio::Events::with_capacity(1024);
        loop {
            let now = current_time_millis();

            let earliest_timer = r.earliest_timer();
            let timeout = earliest_timer.map(|timer| {
                // If `timer` already passed, set `timeout` to be 1ms.
                let millis = if timer > now { timer - now } else { 1 };
                Duration::from_millis(millis)
            });

            // Process incoming packets, command events and optional timeout.
            events.clear();
            match r.poller.poll(&mut events, timeout) {
                Ok(_) => Self::handle_poller_events(&mut r, &events),
                Err(e) => debug!("failed to select from sockets: {}", e),
            }

            let now = current_time_millis();

            if r.probe_timer.take_fired(now) {
                r.probe_window_elapsed();
            }

            if r.rebind_timer.take_fired(now) {
                r.rebind_pass(now);
            }

            // process commands from the command channel
            while let Ok(command) = receiver.try_recv() {
                if matches!(command, Command::Exit(_)) {
                    r.status = ResponderStatus::Shutdown;
                    return Some(command);
                }
                r.exec_command(command);
            }
        }
    }
}

/// A single-shot deadline in UNIX millis.
///
/// Scheduling again replaces any pending deadline, i.e. rescheduling
/// implicitly cancels the previous schedule.
#[derive(Debug, Default)]
struct Timer {
    deadline: Option<u64>,
}

impl Timer {
    const fn new() -> Self {
        Self { deadline: None }
    }

    fn schedule(&mut self, at: u64) {
        self.deadline = Some(at);
    }

    fn cancel(&mut self) {
        self.deadline = None;
    }

    const fn next(&self) -> Option<u64> {
        self.deadline
    }

    /// Returns true and disarms if the deadline has passed.
    fn take_fired(&mut self, now: u64) -> bool {
        match self.deadline {
            Some(at) if now >= at => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// The hostname claim state machine.
///
/// While `confirmed` is false the candidate may be renamed any number of
/// times; once true the name is immutable for the process lifetime, even
/// if a conflicting claim shows up later (upstream behavior, kept as is).
#[derive(Debug, Clone)]
struct HostnameState {
    /// The bare machine name, lower-cased.
    local_name: String,

    /// The candidate (or confirmed) hostname, dot-terminated.
    name: String,

    /// Disambiguation suffix: unset until the first conflict, then 2, 3, ...
    suffix: Option<u32>,

    confirmed: bool,

    /// Set when the suffix cap was hit. Probing stops until the next
    /// maintenance pass restarts the claim.
    gave_up: bool,
}

impl HostnameState {
    fn new(local_name: &str) -> Self {
        let local_name = local_name.to_lowercase();
        let name = format!("{}.local.", local_name);
        Self {
            local_name,
            name,
            suffix: None,
            confirmed: false,
            gave_up: false,
        }
    }

    /// Restarts the claim from the bare machine name. Only called while
    /// unconfirmed.
    fn restart(&mut self) {
        self.name = format!("{}.local.", self.local_name);
        self.suffix = None;
        self.gave_up = false;
    }

    const fn is_probing(&self) -> bool {
        !self.confirmed && !self.gave_up
    }

    /// Picks the next candidate after a conflict: `laptop.local.` becomes
    /// `laptop-2.local.`, then `laptop-3.local.`, and so on.
    fn rename(&mut self, max_suffix: u32) -> Result<()> {
        let next = self.suffix.map_or(2, |s| s + 1);
        if next > max_suffix {
            self.gave_up = true;
            return Err(e_fmt!(
                "hostname {} still conflicted at suffix cap {}, giving up",
                self.name,
                max_suffix
            ));
        }
        self.suffix = Some(next);
        self.name = format!("{}-{}.local.", self.local_name, next);
        Ok(())
    }

    /// Returns true if `msg` disqualifies the current candidate: a response
    /// carrying a live address record under the candidate name.
    ///
    /// A record with TTL 0 is a goodbye (record removal), not a live claim,
    /// and must not trigger a conflict.
    fn has_conflict(&self, msg: &DnsIncoming) -> bool {
        if !msg.is_response() {
            return false;
        }
        msg.records().iter().any(|record| {
            matches!(record.ty(), RRType::A | RRType::AAAA)
                && record.ttl() > 0
                && record.name() == self.name
        })
    }
}

/// A struct holding the daemon state.
struct Responder {
    config: ResponderConfig,

    /// The two mDNS sockets, one per IP family. `None` means unbound;
    /// either family may be unbound while the other operates.
    sock_v4: Option<MioUdpSocket>,
    sock_v6: Option<MioUdpSocket>,

    hostname: HostnameState,

    /// Single-shot probe window timer. Restarted on every (re)probe.
    probe_timer: Timer,

    /// Periodic bind/rejoin maintenance timer.
    rebind_timer: Timer,

    /// Waits for incoming packets.
    poller: Poll,

    /// Socket for signaling.
    signal_sock: MioUdpSocket,

    /// Channels to notify events.
    monitors: Vec<Sender<ResponderEvent>>,

    status: ResponderStatus,
}

impl Responder {
    fn new(config: ResponderConfig, signal_sock: MioUdpSocket, poller: Poll) -> Self {
        let hostname = HostnameState::new(&machine_local_name());

        Self {
            config,
            sock_v4: None,
            sock_v6: None,
            hostname,
            probe_timer: Timer::new(),
            rebind_timer: Timer::new(),
            poller,
            signal_sock,
            monitors: Vec::new(),
            status: ResponderStatus::Running,
        }
    }

    fn notify_monitors(&mut self, event: ResponderEvent) {
        // Only retain the monitors that are still connected.
        self.monitors.retain(|sender| {
            if let Err(e) = sender.try_send(event.clone()) {
                debug!("notify_monitors: try_send: {}", &e);
                if matches!(e, TrySendError::Disconnected(_)) {
                    return false; // This monitor is dropped.
                }
            }
            true
        });
    }

    fn earliest_timer(&self) -> Option<u64> {
        match (self.probe_timer.next(), self.rebind_timer.next()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn family_sock(&self, family: IpFamily) -> Option<&MioUdpSocket> {
        match family {
            IpFamily::V4 => self.sock_v4.as_ref(),
            IpFamily::V6 => self.sock_v6.as_ref(),
        }
    }

    fn reregister_family(&mut self, family: IpFamily, token: mio::Token) {
        let sock = match family {
            IpFamily::V4 => self.sock_v4.as_mut(),
            IpFamily::V6 => self.sock_v6.as_mut(),
        };
        if let Some(sock) = sock {
            if let Err(e) = self
                .poller
                .registry()
                .reregister(sock, token, mio::Interest::READABLE)
            {
                debug!("modify poller for {} socket: {}", family, e);
            }
        }
    }

    /// The maintenance pass: binds any unbound family socket, joins the
    /// multicast groups on all current interfaces, and, while the hostname
    /// is unconfirmed, (re)starts probing from the machine name.
    ///
    /// Re-runs on a fixed interval forever; a bind failure here is reported
    /// and retried on the next pass, never fatal.
    fn rebind_pass(&mut self, now: u64) {
        for family in [IpFamily::V4, IpFamily::V6] {
            if self.family_sock(family).is_some() {
                continue;
            }
            match bind_family_socket(&self.config, family) {
                Ok(mut sock) => {
                    let key = match family {
                        IpFamily::V4 => SOCK_EVENT_KEY_V4,
                        IpFamily::V6 => SOCK_EVENT_KEY_V6,
                    };
                    if let Err(e) = self.poller.registry().register(
                        &mut sock,
                        mio::Token(key),
                        mio::Interest::READABLE,
                    ) {
                        self.notify_monitors(ResponderEvent::Error(e_fmt!(
                            "add {} socket to poller: {}",
                            family,
                            e
                        )));
                        continue;
                    }
                    match family {
                        IpFamily::V4 => self.sock_v4 = Some(sock),
                        IpFamily::V6 => self.sock_v6 = Some(sock),
                    }
                    self.notify_monitors(ResponderEvent::Bound(family));
                }
                Err(e) => self.notify_monitors(ResponderEvent::Error(e)),
            }
        }

        self.join_multicast_groups();

        // If the hostname has not been confirmed yet, begin checking
        // hostnames from scratch.
        if (self.sock_v4.is_some() || self.sock_v6.is_some()) && !self.hostname.confirmed {
            self.hostname.restart();
            self.send_probes();
            self.probe_timer.schedule(now + self.config.probe_wait_millis);
        }

        // Run this method again after the rebind interval.
        self.rebind_timer
            .schedule(now + self.config.rebind_interval_millis);
    }

    /// Joins the multicast groups on every multicast-capable interface.
    ///
    /// The join gate mirrors the upstream responder exactly, asymmetry
    /// included: both families' joins require the interface to own an
    /// IPv6 address. "Already a member" errors on re-runs are expected
    /// and ignored.
    fn join_multicast_groups(&self) {
        for iface in host_interfaces() {
            let has_v4 = iface.has_v4();
            let has_v6 = iface.has_v6();
            trace!(
                "interface {}: has_v4 {} has_v6 {}",
                &iface.name,
                has_v4,
                has_v6
            );
            let (v4_local, v6_index) = join_targets(&iface);
            if let (Some(sock), Some(local)) = (&self.sock_v4, v4_local) {
                if let Err(e) = sock.join_multicast_v4(&self.config.group_v4, &local) {
                    trace!("join IPv4 group on {}: {}", &iface.name, e);
                }
            }
            if let (Some(sock), Some(index)) = (&self.sock_v6, v6_index) {
                if let Err(e) = sock.join_multicast_v6(&self.config.group_v6, index) {
                    trace!("join IPv6 group on {}: {}", &iface.name, e);
                }
            }
        }
    }

    /// Sends the probes for the current candidate: an A query via the IPv4
    /// socket and an AAAA query via the IPv6 socket, each to its group.
    /// An unbound family skips its probe.
    fn send_probes(&self) {
        if let Some(sock) = &self.sock_v4 {
            let out = probe_message(&self.hostname.name, RRType::A);
            let dest = SocketAddrV4::new(self.config.group_v4, self.config.port).into();
            send_dns_outgoing(&out, dest, sock);
        }
        if let Some(sock) = &self.sock_v6 {
            let out = probe_message(&self.hostname.name, RRType::AAAA);
            let dest = SocketAddrV6::new(self.config.group_v6, self.config.port, 0, 0).into();
            send_dns_outgoing(&out, dest, sock);
        }
    }

    /// Reads from the socket of `family`.
    ///
    /// Returns false if failed to receive a packet,
    /// otherwise returns true.
    fn handle_read(&mut self, family: IpFamily) -> bool {
        let mut buf = vec![0u8; MAX_MSG_ABSOLUTE];

        let (sz, src) = {
            let sock = match self.family_sock(family) {
                Some(sock) => sock,
                None => return false,
            };
            match sock.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::WouldBlock {
                        debug!("listening socket read failed: {}", e);
                    }
                    return false;
                }
            }
        };

        trace!("received {} bytes from {} over {}", sz, src, family);
        buf.truncate(sz); // reduce potential processing errors

        let msg = match DnsIncoming::new(buf) {
            Ok(msg) => msg,
            Err(e) => {
                // Malformed and foreign traffic is expected on a shared
                // multicast group: drop without surfacing an error.
                trace!("invalid incoming DNS message from {}: {}", src, e);
                return true;
            }
        };

        if self.hostname.confirmed {
            self.handle_query(&msg, family, src);
        } else {
            self.handle_probe_response(&msg);
        }

        true
    }

    /// While probing, the only messages of interest are responses that
    /// indicate our chosen hostname is already in use.
    fn handle_probe_response(&mut self, msg: &DnsIncoming) {
        if !self.hostname.is_probing() || !self.hostname.has_conflict(msg) {
            return;
        }

        let from = self.hostname.name.clone();
        match self.hostname.rename(self.config.max_suffix) {
            Ok(()) => {
                let to = self.hostname.name.clone();
                debug!("hostname {} is taken, probing {}", &from, &to);
                self.notify_monitors(ResponderEvent::HostnameChange { from, to });
                self.send_probes();
                self.probe_timer
                    .schedule(current_time_millis() + self.config.probe_wait_millis);
            }
            Err(e) => {
                self.probe_timer.cancel();
                self.notify_monitors(ResponderEvent::Error(e));
            }
        }
    }

    /// The probe window elapsed with no challenge: the candidate is ours.
    fn probe_window_elapsed(&mut self) {
        if !self.hostname.is_probing() {
            return;
        }
        self.hostname.confirmed = true;
        debug!("hostname {} confirmed", &self.hostname.name);
        self.notify_monitors(ResponderEvent::HostnameConfirmed(self.hostname.name.clone()));
    }

    /// Answers address queries for the confirmed hostname.
    ///
    /// The reply carries whichever of the requested A/AAAA records could be
    /// generated for this querier; if neither could, no reply is sent at
    /// all rather than an empty-answer message.
    fn handle_query(&mut self, msg: &DnsIncoming, family: IpFamily, src: SocketAddr) {
        let ifaces = host_interfaces();
        let reply = match build_reply(
            &ifaces,
            &self.hostname.name,
            msg,
            src.ip(),
            self.config.host_ttl,
        ) {
            Some(reply) => reply,
            None => return,
        };

        let dest = reply_destination(&self.config, family, src);
        if let Some(sock) = self.family_sock(family) {
            send_dns_outgoing(&reply, dest, sock);
        }
    }

    fn exec_command(&mut self, command: Command) {
        match command {
            Command::GetHostname(resp_s) => {
                let status = HostnameStatus {
                    name: self.hostname.name.clone(),
                    confirmed: self.hostname.confirmed,
                };
                if let Err(e) = resp_s.send(status) {
                    debug!("exec_command GetHostname: send failed: {}", e);
                }
            }
            Command::GetStatus(resp_s) => {
                if let Err(e) = resp_s.send(self.status.clone()) {
                    debug!("exec_command GetStatus: send failed: {}", e);
                }
            }
            Command::Monitor(resp_s) => {
                self.monitors.push(resp_s);
            }
            Command::Exit(_) => debug!("Exit command should be handled in the run loop"),
        }
    }

    fn signal_sock_drain(&self) {
        let mut signal_buf = [0; 1024];
        while let Ok(sz) = self.signal_sock.recv(&mut signal_buf) {
            trace!(
                "signal socket recvd: {}",
                String::from_utf8_lossy(&signal_buf[0..sz])
            );
        }
    }
}

/// Commands supported by the daemon
#[derive(Debug)]
enum Command {
    /// Read the current hostname claim.
    GetHostname(Sender<HostnameStatus>),

    /// Get the current status of the daemon.
    GetStatus(Sender<ResponderStatus>),

    /// Monitor noticable events in the daemon.
    Monitor(Sender<ResponderEvent>),

    Exit(Sender<ResponderStatus>),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetHostname(_) => write!(f, "Command GetHostname"),
            Self::GetStatus(_) => write!(f, "Command GetStatus"),
            Self::Monitor(_) => write!(f, "Command Monitor"),
            Self::Exit(_) => write!(f, "Command Exit"),
        }
    }
}

/// Assembles the answer for an inbound query, or `None` when no reply is
/// warranted.
///
/// `None` covers all the silent cases: the message is not a query, none of
/// its questions asks for our hostname's A/AAAA records, or no requested
/// record could be generated for this querier. A reply with an empty
/// answer section is never sent.
fn build_reply(
    ifaces: &[IfaceSnapshot],
    hostname: &str,
    msg: &DnsIncoming,
    querier: IpAddr,
    ttl: u32,
) -> Option<DnsOutgoing> {
    if !msg.is_query() {
        return None;
    }

    // Check to see if any of the queries were for this host.
    let mut query_a = false;
    let mut query_aaaa = false;
    for question in msg.questions() {
        if question.name() == hostname {
            query_a = query_a || question.ty() == RRType::A;
            query_aaaa = query_aaaa || question.ty() == RRType::AAAA;
        }
    }
    if !query_a && !query_aaaa {
        return None;
    }

    // Echo the query's transaction ID: legacy one-shot queriers match
    // answers against it.
    let mut reply = DnsOutgoing::reply_to(FLAGS_QR_RESPONSE | FLAGS_AA, msg);
    if query_a {
        if let Some(record) = generate_record(ifaces, hostname, querier, RRType::A, ttl) {
            reply.add_answer(record);
        }
    }
    if query_aaaa {
        if let Some(record) = generate_record(ifaces, hostname, querier, RRType::AAAA, ttl) {
            reply.add_answer(record);
        }
    }

    if reply.answers_count() == 0 {
        trace!("no local address answers querier {}; staying silent", querier);
        return None;
    }
    Some(reply)
}

/// Builds one probe: a query-only message (no answer section) asking for
/// the candidate name.
fn probe_message(candidate: &str, qtype: RRType) -> DnsOutgoing {
    let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);
    out.add_question(candidate, qtype);
    out
}

/// Creates and binds a UDP socket for `family` on the mDNS port.
///
/// The first attempt binds with address sharing only; if the sharing flag
/// alone is insufficient on this platform, a second attempt additionally
/// sets the raw port-reuse option before the bind.
fn bind_family_socket(config: &ResponderConfig, family: IpFamily) -> Result<MioUdpSocket> {
    let addr: SocketAddr = match family {
        IpFamily::V4 => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port).into(),
        IpFamily::V6 => SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, config.port, 0, 0).into(),
    };

    let sock = match new_socket(addr, false) {
        Ok(sock) => sock,
        Err(e) => {
            trace!("bind {} with address sharing failed: {}; retrying", addr, e);
            new_socket(addr, true).map_err(|e| e_fmt!("bind {} socket: {}", family, e))?
        }
    };

    Ok(MioUdpSocket::from_std(UdpSocket::from(sock)))
}

/// Creates a new nonblocking UDP socket bound to `addr`.
/// `reuse_port` additionally sets the SO_REUSEPORT option where available.
fn new_socket(addr: SocketAddr, reuse_port: bool) -> Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };

    let fd = Socket::new(domain, socket2::Type::DGRAM, None)
        .map_err(|e| e_fmt!("create socket failed: {}", e))?;

    fd.set_reuse_address(true)
        .map_err(|e| e_fmt!("set ReuseAddr failed: {}", e))?;

    #[cfg(unix)]
    if reuse_port {
        fd.set_reuse_port(true)
            .map_err(|e| e_fmt!("set ReusePort failed: {}", e))?;
    }

    if addr.is_ipv6() {
        // Keep the v6 socket from capturing v4 traffic; the v4 socket
        // binds the same port.
        fd.set_only_v6(true)
            .map_err(|e| e_fmt!("set only_v6 failed: {}", e))?;
    }

    fd.set_nonblocking(true)
        .map_err(|e| e_fmt!("set O_NONBLOCK: {}", e))?;

    fd.bind(&addr.into())
        .map_err(|e| e_fmt!("socket bind to {} failed: {}", &addr, e))?;

    trace!("new socket bind to {}", &addr);
    Ok(fd)
}

/// Picks where a reply goes: queriers on the mDNS port are answered via
/// the multicast group; any other source port indicates a legacy one-shot
/// querier that expects a unicast answer.
fn reply_destination(config: &ResponderConfig, family: IpFamily, src: SocketAddr) -> SocketAddr {
    if src.port() != config.port {
        return src;
    }
    match family {
        IpFamily::V4 => SocketAddrV4::new(config.group_v4, config.port).into(),
        IpFamily::V6 => SocketAddrV6::new(config.group_v6, config.port, 0, 0).into(),
    }
}

/// Send an outgoing message to `addr` via `sock`. Fire-and-forget.
fn send_dns_outgoing(out: &DnsOutgoing, addr: SocketAddr, sock: &MioUdpSocket) {
    let packet = out.to_data_on_wire();
    trace!("send {} bytes to {}", packet.len(), &addr);
    if let Err(e) = sock.send_to(&packet, addr) {
        debug!("send to {} failed: {}", &addr, e);
    }
}

/// Returns the machine's bare name, lower-cased, without any domain part.
fn machine_local_name() -> String {
    let name = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_default();

    let name = name.split('.').next().unwrap_or("").to_lowercase();
    if name.is_empty() {
        "localhost".to_string()
    } else {
        name
    }
}

/// One address owned by an interface, with its netmask.
#[derive(Debug, Clone)]
struct IfaceAddr {
    ip: IpAddr,
    netmask: IpAddr,
}

/// A point-in-time view of one network interface and all its addresses.
///
/// `if-addrs` yields one entry per address; the reply-routing logic needs
/// one interface owning many addresses, so entries are regrouped by
/// interface name. Snapshots are re-taken on demand, never cached, so the
/// current OS topology always wins.
#[derive(Debug, Clone)]
struct IfaceSnapshot {
    name: String,
    index: Option<u32>,
    addrs: Vec<IfaceAddr>,
}

impl IfaceSnapshot {
    fn has_v4(&self) -> bool {
        self.addrs.iter().any(|a| a.ip.is_ipv4())
    }

    fn has_v6(&self) -> bool {
        self.addrs.iter().any(|a| a.ip.is_ipv6())
    }

    fn first_v4(&self) -> Option<Ipv4Addr> {
        self.addrs.iter().find_map(|a| match a.ip {
            IpAddr::V4(ip) => Some(ip),
            _ => None,
        })
    }
}

/// Join targets for one interface: the local address for the IPv4 group
/// join and the interface index for the IPv6 group join.
///
/// Both targets require the interface to own an IPv6 address; the
/// cross-family gate is the upstream join policy, reproduced exactly.
/// A missing local v4 address or interface index yields `None`, which
/// skips that family's join on this interface. Falling back to the
/// unspecified address or index 0 would join on the OS-default interface
/// instead of the enumerated one.
fn join_targets(iface: &IfaceSnapshot) -> (Option<Ipv4Addr>, Option<u32>) {
    if !iface.has_v6() {
        return (None, None);
    }
    (iface.first_v4(), iface.index)
}

/// Enumerates the host's non-loopback interfaces, grouped by name.
///
/// Loopback exclusion stands in for a multicast-capability check, which
/// `if-addrs` does not expose.
fn host_interfaces() -> Vec<IfaceSnapshot> {
    let mut snapshots: Vec<IfaceSnapshot> = Vec::new();

    for intf in if_addrs::get_if_addrs().unwrap_or_default() {
        if intf.is_loopback() {
            continue;
        }
        let (ip, netmask) = match &intf.addr {
            IfAddr::V4(v4) => (IpAddr::V4(v4.ip), IpAddr::V4(v4.netmask)),
            IfAddr::V6(v6) => (IpAddr::V6(v6.ip), IpAddr::V6(v6.netmask)),
        };
        let addr = IfaceAddr { ip, netmask };

        match snapshots.iter_mut().find(|snap| snap.name == intf.name) {
            Some(snap) => {
                if snap.index.is_none() {
                    snap.index = intf.index;
                }
                snap.addrs.push(addr);
            }
            None => snapshots.push(IfaceSnapshot {
                name: intf.name.clone(),
                index: intf.index,
                addrs: vec![addr],
            }),
        }
    }

    snapshots
}

/// Returns true if `addr` is in the same network as the interface address
/// entry.
fn in_subnet(addr: IpAddr, entry: &IfaceAddr) -> bool {
    match (addr, entry.ip, entry.netmask) {
        (IpAddr::V4(addr), IpAddr::V4(ip), IpAddr::V4(netmask)) => {
            let netmask = u32::from(netmask);
            (u32::from(addr) & netmask) == (u32::from(ip) & netmask)
        }
        (IpAddr::V6(addr), IpAddr::V6(ip), IpAddr::V6(netmask)) => {
            let netmask = u128::from(netmask);
            (u128::from(addr) & netmask) == (u128::from(ip) & netmask)
        }
        _ => false,
    }
}

/// Finds the local address record of type `ty` that should answer `querier`.
///
/// The answering interface is the one owning an address entry whose subnet
/// contains the querier's source address: the interface topologically
/// nearest the asker. The interface must also hold at least one address of
/// the requested family, but the record answers with the subnet-matched
/// entry's address, not the family-scan hit (upstream behavior, kept as
/// is). An interface that matches the subnet but fails the family scan
/// falls through to the remaining interfaces.
fn generate_record(
    ifaces: &[IfaceSnapshot],
    hostname: &str,
    querier: IpAddr,
    ty: RRType,
    ttl: u32,
) -> Option<DnsAddress> {
    for iface in ifaces {
        let entry = match iface.addrs.iter().find(|entry| in_subnet(querier, entry)) {
            Some(entry) => entry,
            None => continue,
        };

        let family_matched = iface
            .addrs
            .iter()
            .any(|addr| ip_address_rr_type(&addr.ip) == ty);
        if family_matched {
            return Some(DnsAddress::new(
                hostname,
                ty,
                CLASS_IN | CLASS_CACHE_FLUSH,
                ttl,
                entry.ip,
            ));
        }
    }
    None
}

/// Returns UNIX time in millis
fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("failed to get current UNIX time")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::{
        build_reply, current_time_millis, generate_record, in_subnet, join_targets,
        machine_local_name, probe_message, reply_destination, HostnameState, IfaceAddr,
        IfaceSnapshot, IpFamily, ResponderConfig, Timer,
    };
    use crate::dns_parser::{
        DnsAddress, DnsIncoming, DnsOutgoing, RRType, CLASS_CACHE_FLUSH, CLASS_IN, FLAGS_AA,
        FLAGS_QR_QUERY, FLAGS_QR_RESPONSE,
    };
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
    use test_log::test;

    fn response_with(name: &str, ty: RRType, ttl: u32, addr: IpAddr) -> DnsIncoming {
        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        out.add_answer(DnsAddress::new(
            name,
            ty,
            CLASS_IN | CLASS_CACHE_FLUSH,
            ttl,
            addr,
        ));
        DnsIncoming::new(out.to_data_on_wire()).unwrap()
    }

    fn test_ifaces() -> Vec<IfaceSnapshot> {
        vec![
            IfaceSnapshot {
                name: "en0".to_string(),
                index: Some(2),
                addrs: vec![
                    IfaceAddr {
                        ip: IpAddr::V4(Ipv4Addr::new(10, 0, 1, 5)),
                        netmask: IpAddr::V4(Ipv4Addr::new(255, 255, 255, 0)),
                    },
                    IfaceAddr {
                        ip: IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
                        netmask: IpAddr::V6(Ipv6Addr::new(
                            0xffff, 0xffff, 0xffff, 0xffff, 0, 0, 0, 0,
                        )),
                    },
                ],
            },
            IfaceSnapshot {
                name: "en1".to_string(),
                index: Some(3),
                addrs: vec![IfaceAddr {
                    ip: IpAddr::V4(Ipv4Addr::new(192, 168, 7, 20)),
                    netmask: IpAddr::V4(Ipv4Addr::new(255, 255, 255, 0)),
                }],
            },
        ]
    }

    #[test]
    fn test_rename_sequence() {
        // N distinct conflicts must yield `<name>-<N+1>.local.`.
        let mut state = HostnameState::new("Laptop");
        assert_eq!(state.name, "laptop.local.");
        assert_eq!(state.suffix, None);

        state.rename(100).unwrap();
        assert_eq!(state.name, "laptop-2.local.");
        state.rename(100).unwrap();
        assert_eq!(state.name, "laptop-3.local.");

        // The probe window elapsing after the second conflict keeps the
        // last candidate forever.
        state.confirmed = true;
        assert_eq!(state.name, "laptop-3.local.");
        assert!(!state.is_probing());
    }

    #[test]
    fn test_rename_cap() {
        let mut state = HostnameState::new("laptop");
        state.rename(3).unwrap();
        state.rename(3).unwrap();
        assert_eq!(state.name, "laptop-3.local.");

        // Suffix 4 exceeds the cap: the claimer gives up.
        assert!(state.rename(3).is_err());
        assert!(state.gave_up);
        assert!(!state.is_probing());

        // The next maintenance pass restarts the claim from scratch.
        state.restart();
        assert_eq!(state.name, "laptop.local.");
        assert_eq!(state.suffix, None);
        assert!(state.is_probing());
    }

    #[test]
    fn test_conflict_detection() {
        let state = HostnameState::new("laptop");
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 23));

        // A live A record under the candidate name: conflict.
        let msg = response_with("laptop.local.", RRType::A, 120, addr);
        assert!(state.has_conflict(&msg));

        // AAAA counts too.
        let msg = response_with(
            "laptop.local.",
            RRType::AAAA,
            120,
            IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 9)),
        );
        assert!(state.has_conflict(&msg));

        // A zero-TTL record is a goodbye, not a live claim.
        let msg = response_with("laptop.local.", RRType::A, 0, addr);
        assert!(!state.has_conflict(&msg));

        // Somebody else's name is not our problem.
        let msg = response_with("printer.local.", RRType::A, 120, addr);
        assert!(!state.has_conflict(&msg));

        // Queries never disqualify a candidate, only responses do.
        let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);
        out.add_question("laptop.local.", RRType::A);
        let msg = DnsIncoming::new(out.to_data_on_wire()).unwrap();
        assert!(!state.has_conflict(&msg));
    }

    #[test]
    fn test_conflict_matches_renamed_candidate() {
        let mut state = HostnameState::new("laptop");
        state.rename(100).unwrap();

        // After the rename only the new candidate can conflict.
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 23));
        let old = response_with("laptop.local.", RRType::A, 120, addr);
        assert!(!state.has_conflict(&old));

        let current = response_with("laptop-2.local.", RRType::A, 120, addr);
        assert!(state.has_conflict(&current));
    }

    #[test]
    fn test_probe_message_is_query_only() {
        let out = probe_message("laptop.local.", RRType::A);
        assert_eq!(out.answers_count(), 0);

        let msg = DnsIncoming::new(out.to_data_on_wire()).unwrap();
        assert!(msg.is_query());
        assert_eq!(msg.questions().len(), 1);
        assert_eq!(msg.questions()[0].name(), "laptop.local.");
        assert!(msg.records().is_empty());
    }

    #[test]
    fn test_generate_record_nearest_interface() {
        let ifaces = test_ifaces();

        // A querier inside en0's IPv4 subnet gets en0's IPv4 address.
        let record = generate_record(
            &ifaces,
            "laptop.local.",
            IpAddr::V4(Ipv4Addr::new(10, 0, 1, 99)),
            RRType::A,
            3600,
        )
        .unwrap();
        assert_eq!(record.name(), "laptop.local.");
        assert_eq!(record.ttl(), 3600);
        assert_eq!(record.address(), IpAddr::V4(Ipv4Addr::new(10, 0, 1, 5)));

        // A querier inside en1's subnet gets en1's address instead.
        let record = generate_record(
            &ifaces,
            "laptop.local.",
            IpAddr::V4(Ipv4Addr::new(192, 168, 7, 42)),
            RRType::A,
            3600,
        )
        .unwrap();
        assert_eq!(record.address(), IpAddr::V4(Ipv4Addr::new(192, 168, 7, 20)));

        // A link-local IPv6 querier gets en0's IPv6 address.
        let record = generate_record(
            &ifaces,
            "laptop.local.",
            IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0x77)),
            RRType::AAAA,
            3600,
        )
        .unwrap();
        assert_eq!(
            record.address(),
            IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1))
        );
    }

    #[test]
    fn test_generate_record_failures() {
        let ifaces = test_ifaces();

        // No interface's subnet contains this querier.
        assert!(generate_record(
            &ifaces,
            "laptop.local.",
            IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1)),
            RRType::A,
            3600,
        )
        .is_none());

        // en1 has no IPv6 address: an AAAA request from its subnet fails.
        assert!(generate_record(
            &ifaces,
            "laptop.local.",
            IpAddr::V4(Ipv4Addr::new(192, 168, 7, 42)),
            RRType::AAAA,
            3600,
        )
        .is_none());
    }

    #[test]
    fn test_build_reply() {
        let ifaces = test_ifaces();
        let querier = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 99));

        // A dual A/AAAA query from en0's subnet gets both records.
        let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);
        out.add_question("laptop.local.", RRType::A);
        out.add_question("laptop.local.", RRType::AAAA);
        let msg = DnsIncoming::new(out.to_data_on_wire()).unwrap();

        let reply = build_reply(&ifaces, "laptop.local.", &msg, querier, 3600).unwrap();
        assert_eq!(reply.answers_count(), 2);
        let decoded = DnsIncoming::new(reply.to_data_on_wire()).unwrap();
        assert!(decoded.is_response());
        assert_eq!(decoded.records().len(), 2);

        // From en1's subnet only the A record generates; the reply carries
        // just that one instead of going silent.
        let querier_en1 = IpAddr::V4(Ipv4Addr::new(192, 168, 7, 42));
        let reply = build_reply(&ifaces, "laptop.local.", &msg, querier_en1, 3600).unwrap();
        assert_eq!(reply.answers_count(), 1);

        // A querier outside every subnet gets nothing at all.
        let stranger = IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1));
        assert!(build_reply(&ifaces, "laptop.local.", &msg, stranger, 3600).is_none());

        // Questions for another host's name are not ours to answer.
        let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);
        out.add_question("printer.local.", RRType::A);
        let msg = DnsIncoming::new(out.to_data_on_wire()).unwrap();
        assert!(build_reply(&ifaces, "laptop.local.", &msg, querier, 3600).is_none());

        // Responses never get replies.
        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        out.add_answer(DnsAddress::new(
            "laptop.local.",
            RRType::A,
            CLASS_IN | CLASS_CACHE_FLUSH,
            3600,
            querier,
        ));
        let msg = DnsIncoming::new(out.to_data_on_wire()).unwrap();
        assert!(build_reply(&ifaces, "laptop.local.", &msg, querier, 3600).is_none());
    }

    #[test]
    fn test_reply_echoes_query_id() {
        let ifaces = test_ifaces();
        let querier = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 99));

        // A legacy unicast querier sets a nonzero transaction ID and
        // rejects answers that do not carry it back.
        let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);
        out.add_question("laptop.local.", RRType::A);
        let mut data = out.to_data_on_wire();
        data[0] = 0x12;
        data[1] = 0x34;
        let msg = DnsIncoming::new(data).unwrap();

        let reply = build_reply(&ifaces, "laptop.local.", &msg, querier, 3600).unwrap();
        assert_eq!(&reply.to_data_on_wire()[0..2], &[0x12, 0x34]);
    }

    #[test]
    fn test_in_subnet() {
        let entry = IfaceAddr {
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 1, 5)),
            netmask: IpAddr::V4(Ipv4Addr::new(255, 255, 255, 0)),
        };
        assert!(in_subnet(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 200)), &entry));
        assert!(!in_subnet(IpAddr::V4(Ipv4Addr::new(10, 0, 2, 200)), &entry));

        // Cross-family comparisons never match.
        assert!(!in_subnet(
            IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
            &entry
        ));
    }

    #[test]
    fn test_join_targets() {
        let ifaces = test_ifaces();

        // en0 owns both families: v4 join uses its v4 address, v6 join its
        // index.
        assert_eq!(
            join_targets(&ifaces[0]),
            (Some(Ipv4Addr::new(10, 0, 1, 5)), Some(2))
        );

        // en1 is v4-only: the cross-family gate skips both joins.
        assert_eq!(join_targets(&ifaces[1]), (None, None));

        // A v6-only interface joins the v6 group on its own index but must
        // not fall back to the default interface for the v4 group.
        let v6_only = IfaceSnapshot {
            name: "wg0".to_string(),
            index: Some(7),
            addrs: vec![IfaceAddr {
                ip: IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 4)),
                netmask: IpAddr::V6(Ipv6Addr::new(0xffff, 0xffff, 0xffff, 0xffff, 0, 0, 0, 0)),
            }],
        };
        assert_eq!(join_targets(&v6_only), (None, Some(7)));

        // No interface index: the v6 join is skipped, not aimed at index 0.
        let no_index = IfaceSnapshot {
            index: None,
            ..v6_only
        };
        assert_eq!(join_targets(&no_index), (None, None));
    }

    #[test]
    fn test_reply_destination() {
        let config = ResponderConfig::default();

        // A querier on the mDNS port is answered via the group.
        let src: SocketAddr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 9), 5353).into();
        let dest = reply_destination(&config, IpFamily::V4, src);
        assert_eq!(dest.to_string(), "224.0.0.251:5353");

        // A legacy querier on an ephemeral port is answered directly.
        let src: SocketAddr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 9), 49152).into();
        let dest = reply_destination(&config, IpFamily::V4, src);
        assert_eq!(dest, src);
    }

    #[test]
    fn test_timer_cancel_on_reschedule() {
        let now = current_time_millis();
        let mut timer = Timer::new();
        assert_eq!(timer.next(), None);
        assert!(!timer.take_fired(now));

        timer.schedule(now + 100);

        // Rescheduling supersedes the earlier deadline entirely.
        timer.schedule(now + 5000);
        assert!(!timer.take_fired(now + 100));
        assert_eq!(timer.next(), Some(now + 5000));

        assert!(timer.take_fired(now + 5000));
        assert_eq!(timer.next(), None);

        timer.schedule(now + 100);
        timer.cancel();
        assert!(!timer.take_fired(now + 10_000));
    }

    #[test]
    fn test_machine_local_name() {
        let name = machine_local_name();
        assert!(!name.is_empty());
        assert!(!name.contains('.'));
        assert_eq!(name, name.to_lowercase());
    }
}
