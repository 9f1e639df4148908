//! Test plumbing: a deterministic stub handshake engine, an in-memory
//! datapath, and a two-endpoint harness with explicit time.
//!
//! The stub engine produces real key material through the built-in
//! provider and carries transport parameters verbatim, so every packet
//! still goes through protection, coalescing, and loss recovery; only the
//! TLS negotiation itself is pretend.

use crate::cid::Cid;
use crate::config::Settings;
use crate::connection::{CidAuthority, Connection, Event, Op};
use crate::crypto::{EpochKeys, ResetTokenKey};
use crate::datapath::{Datagram, Datapath, Transmit};
use crate::error::TransportError;
use crate::packet::PartialPacket;
use crate::tls::{TlsEvent, TlsSession};
use crate::types::{Epoch, LOCAL_CID_LEN, RESET_TOKEN_LEN, Side};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

// Message tags of the stub handshake.
const TAG_CLIENT_HELLO: u8 = 1;
const TAG_SERVER_HELLO: u8 = 2;
const TAG_SERVER_FIN: u8 = 3;
const TAG_CLIENT_FIN: u8 = 4;

/// A handshake engine that negotiates nothing: fixed secrets, parameters
/// exchanged verbatim, one round trip.
pub struct StubTls {
    side: Side,
    local_params: Vec<u8>,
    outbound: [VecDeque<Vec<u8>>; 3],
    inbound: [Vec<u8>; 3],
    events: VecDeque<TlsEvent>,
    started: bool,
    complete: bool,
}

impl StubTls {
    pub fn new(side: Side) -> Box<Self> {
        Box::new(StubTls {
            side,
            local_params: Vec::new(),
            outbound: Default::default(),
            inbound: Default::default(),
            events: VecDeque::new(),
            started: false,
            complete: false,
        })
    }

    fn queue_client_hello(&mut self) {
        let mut msg = vec![TAG_CLIENT_HELLO];
        msg.extend_from_slice(&(self.local_params.len() as u16).to_be_bytes());
        msg.extend_from_slice(&self.local_params);
        self.outbound[Epoch::Initial.index()].push_back(msg);
        self.started = true;
    }

    fn handshake_keys(&self) -> EpochKeys {
        match self.side {
            Side::Client => EpochKeys::from_secrets(b"stub client hs", b"stub server hs"),
            Side::Server => EpochKeys::from_secrets(b"stub server hs", b"stub client hs"),
        }
    }

    fn app_keys(&self) -> EpochKeys {
        match self.side {
            Side::Client => EpochKeys::from_secrets(b"stub client app", b"stub server app"),
            Side::Server => EpochKeys::from_secrets(b"stub server app", b"stub client app"),
        }
    }

    /// Split one `[tag, len16, body]` message off an inbound buffer.
    fn take_message(buf: &mut Vec<u8>) -> Option<(u8, Vec<u8>)> {
        if buf.len() < 3 {
            return None;
        }
        let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        if buf.len() < 3 + len {
            return None;
        }
        let tag = buf[0];
        let body = buf[3..3 + len].to_vec();
        buf.drain(..3 + len);
        Some((tag, body))
    }
}

impl TlsSession for StubTls {
    fn set_transport_params(&mut self, params: Vec<u8>) {
        self.local_params = params;
        if self.side == Side::Client && !self.started {
            self.queue_client_hello();
        }
    }

    fn write_handshake(&mut self, epoch: Epoch, data: &[u8]) -> Result<(), TransportError> {
        self.inbound[epoch.index()].extend_from_slice(data);
        loop {
            let buf = &mut self.inbound[epoch.index()];
            let Some((tag, body)) = Self::take_message(buf) else { break };
            match (self.side, tag, epoch) {
                (Side::Server, TAG_CLIENT_HELLO, Epoch::Initial) => {
                    let peer_params = body;
                    self.events.push_back(TlsEvent::Keys {
                        epoch: Epoch::Handshake,
                        keys: self.handshake_keys(),
                    });
                    self.outbound[Epoch::Initial.index()].push_back(vec![TAG_SERVER_HELLO, 0, 0]);
                    let mut fin = vec![TAG_SERVER_FIN];
                    fin.extend_from_slice(&(self.local_params.len() as u16).to_be_bytes());
                    fin.extend_from_slice(&self.local_params);
                    self.outbound[Epoch::Handshake.index()].push_back(fin);
                    self.events.push_back(TlsEvent::Keys {
                        epoch: Epoch::AppData,
                        keys: self.app_keys(),
                    });
                    // Stash until the client finishes.
                    self.inbound[Epoch::AppData.index()] = peer_params;
                }
                (Side::Client, TAG_SERVER_HELLO, Epoch::Initial) => {
                    self.events.push_back(TlsEvent::Keys {
                        epoch: Epoch::Handshake,
                        keys: self.handshake_keys(),
                    });
                }
                (Side::Client, TAG_SERVER_FIN, Epoch::Handshake) => {
                    self.events.push_back(TlsEvent::Keys {
                        epoch: Epoch::AppData,
                        keys: self.app_keys(),
                    });
                    self.outbound[Epoch::Handshake.index()].push_back(vec![TAG_CLIENT_FIN, 0, 0]);
                    self.complete = true;
                    self.events.push_back(TlsEvent::HandshakeComplete {
                        peer_params: body,
                        alpn: Some(b"stub".to_vec()),
                    });
                }
                (Side::Server, TAG_CLIENT_FIN, Epoch::Handshake) => {
                    self.complete = true;
                    let peer_params =
                        std::mem::take(&mut self.inbound[Epoch::AppData.index()]);
                    self.events.push_back(TlsEvent::HandshakeComplete {
                        peer_params,
                        alpn: Some(b"stub".to_vec()),
                    });
                    self.events.push_back(TlsEvent::Ticket(b"stub ticket".to_vec()));
                }
                _ => return Err(TransportError::CryptoError(10)),
            }
        }
        Ok(())
    }

    fn read_handshake(&mut self, epoch: Epoch) -> Option<Vec<u8>> {
        self.outbound[epoch.index()].pop_front()
    }

    fn poll_event(&mut self) -> Option<TlsEvent> {
        self.events.pop_front()
    }

    fn local_params(&self) -> &[u8] {
        &self.local_params
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Datapath that parks transmits for the test to route by hand.
#[derive(Default)]
pub struct MemoryDatapath {
    outbox: Mutex<Vec<Transmit>>,
}

impl MemoryDatapath {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn drain(&self) -> Vec<Transmit> {
        std::mem::take(&mut *self.outbox.lock().unwrap())
    }
}

impl Datapath for MemoryDatapath {
    fn send(&self, transmit: Transmit) {
        self.outbox.lock().unwrap().push(transmit);
    }
}

/// CID authority with no binding behind it: fresh random CIDs always
/// succeed.
pub struct TestAuthority {
    reset_key: ResetTokenKey,
}

impl TestAuthority {
    pub fn new() -> Arc<Self> {
        Arc::new(TestAuthority { reset_key: ResetTokenKey::new() })
    }
}

impl CidAuthority for TestAuthority {
    fn issue_cid(&self, partition: u8) -> Option<(Cid, [u8; RESET_TOKEN_LEN])> {
        let cid = Cid::random_local(partition);
        Some((cid, self.reset_key.token_for(&cid)))
    }

    fn retire_cid(&self, _cid: &Cid) {}
}

/// Two connections wired back to back with explicit time and a loss hook.
/// Everything is deterministic: the test advances `now` by hand and
/// decides per datagram whether it is delivered.
pub struct Pair {
    pub client: Connection,
    pub server: Connection,
    pub client_events: mpsc::UnboundedReceiver<Event>,
    pub server_events: mpsc::UnboundedReceiver<Event>,
    pub now: Instant,
    /// Datagrams waiting to be delivered: (destination side, datagram).
    pub in_flight: VecDeque<(Side, Datagram)>,
    /// Return false to drop the datagram heading to `Side`.
    pub deliver: Box<dyn FnMut(Side, &Transmit) -> bool>,
    /// Simulated NAT rebind: client traffic appears to come from this
    /// address, and server traffic to it is routed back to the client.
    pub nat_override: Option<SocketAddr>,
}

pub fn client_addr() -> SocketAddr {
    "10.0.0.1:40000".parse().unwrap()
}

pub fn server_addr() -> SocketAddr {
    "10.0.0.2:443".parse().unwrap()
}

impl Pair {
    pub fn new(client_settings: Settings, server_settings: Settings) -> Pair {
        let now = Instant::now();
        let (client_tx, client_events) = mpsc::unbounded_channel();
        let (server_tx, server_events) = mpsc::unbounded_channel();

        let (mut client, _client_scid) = Connection::new_client(
            client_settings,
            StubTls::new(Side::Client),
            TestAuthority::new(),
            client_addr(),
            server_addr(),
            0,
            Vec::new(),
            client_tx,
            now,
        )
        .unwrap();

        // The client's first flight tells us what the server must expect.
        let first_flight = client.flush(now);
        assert!(!first_flight.is_empty(), "client produced no initial");
        let (initial, _) =
            PartialPacket::decode(&first_flight[0].payload, 0, LOCAL_CID_LEN).unwrap();
        let odcid = initial.dcid;

        let (server, _server_scid) = Connection::new_server(
            server_settings,
            StubTls::new(Side::Server),
            TestAuthority::new(),
            server_addr(),
            client_addr(),
            0,
            odcid,
            initial.scid.unwrap(),
            None,
            false,
            server_tx,
            now,
        )
        .unwrap();

        let mut pair = Pair {
            client,
            server,
            client_events,
            server_events,
            now,
            in_flight: VecDeque::new(),
            deliver: Box::new(|_, _| true),
            nat_override: None,
        };
        for transmit in first_flight {
            pair.queue_transmit(Side::Client, transmit);
        }
        pair
    }

    pub fn with_defaults() -> Pair {
        Pair::new(Settings::default(), Settings::default())
    }

    fn queue_transmit(&mut self, from: Side, transmit: Transmit) {
        let to = from.peer();
        if !(self.deliver)(to, &transmit) {
            return;
        }
        let mut datagram = Datagram {
            local: transmit.remote,
            remote: transmit.local,
            payload: transmit.payload,
            ecn: transmit.ecn,
        };
        if let Some(nat) = self.nat_override {
            match to {
                // Client packets appear rebound to the NAT address.
                Side::Server => datagram.remote = nat,
                // Server packets aimed at the NAT address reach the client.
                Side::Client if datagram.local == nat => datagram.local = client_addr(),
                Side::Client => {}
            }
        }
        self.in_flight.push_back((to, datagram));
    }

    fn conn(&mut self, side: Side) -> &mut Connection {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    /// Deliver queued datagrams and flush both sides until quiet.
    pub fn drive(&mut self) {
        for _ in 0..200 {
            let mut progressed = false;
            while let Some((to, datagram)) = self.in_flight.pop_front() {
                progressed = true;
                let now = self.now;
                self.conn(to).handle_op(Op::Receive(datagram), now);
                for transmit in self.conn(to).flush(now) {
                    self.queue_transmit(to, transmit);
                }
            }
            for side in [Side::Client, Side::Server] {
                let now = self.now;
                for transmit in self.conn(side).flush(now) {
                    progressed = true;
                    self.queue_transmit(side, transmit);
                }
            }
            if !progressed {
                return;
            }
        }
    }

    /// Move time forward, firing due timers as it passes.
    pub fn advance(&mut self, duration: Duration) {
        let target = self.now + duration;
        for _ in 0..64 {
            let next = [Side::Client, Side::Server]
                .into_iter()
                .filter_map(|s| self.conn(s).next_timeout())
                .min();
            match next {
                Some(deadline) if deadline <= target => {
                    self.now = self.now.max(deadline);
                    for side in [Side::Client, Side::Server] {
                        let due = self
                            .conn(side)
                            .next_timeout()
                            .is_some_and(|d| d <= self.now);
                        if due {
                            let now = self.now;
                            self.conn(side).handle_op(Op::Timer, now);
                            for transmit in self.conn(side).flush(now) {
                                self.queue_transmit(side, transmit);
                            }
                        }
                    }
                    self.drive();
                }
                _ => break,
            }
        }
        self.now = target;
    }

    /// Run the handshake to confirmation on both sides.
    pub fn handshake(&mut self) {
        self.drive();
        assert!(self.client.is_handshake_confirmed(), "client not confirmed");
        assert!(self.server.is_handshake_confirmed(), "server not confirmed");
    }

    pub fn api(&mut self, side: Side, op: crate::connection::ApiOp) {
        let now = self.now;
        self.conn(side).handle_op(Op::Api(op), now);
        let transmits = self.conn(side).flush(now);
        for transmit in transmits {
            self.queue_transmit(side, transmit);
        }
    }

    /// Drain all pending events for one side.
    pub fn events(&mut self, side: Side) -> Vec<Event> {
        let rx = match side {
            Side::Client => &mut self.client_events,
            Side::Server => &mut self.server_events,
        };
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }
}
