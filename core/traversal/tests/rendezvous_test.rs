//! End-to-end rendezvous over loopback UDP
//!
//! A server and two clients run in the test thread, each on its own socket.

use std::cell::RefCell;
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use traversal::{
    is_hole_punch, ClientState, ConnectFailedReason, Transport, TraversalClient,
    TraversalHandler, TraversalServer,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn nonblocking_socket() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_nonblocking(true).unwrap();
    socket
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    State(ClientState),
    Ready(SocketAddr),
    Failed(ConnectFailedReason),
}

#[derive(Clone, Default)]
struct Recorder(Rc<RefCell<Vec<Event>>>);

impl TraversalHandler for Recorder {
    fn on_state_changed(&mut self, state: ClientState) {
        self.0.borrow_mut().push(Event::State(state));
    }

    fn on_connect_ready(&mut self, addr: SocketAddr) {
        self.0.borrow_mut().push(Event::Ready(addr));
    }

    fn on_connect_failed(&mut self, reason: ConnectFailedReason) {
        self.0.borrow_mut().push(Event::Failed(reason));
    }
}

struct Harness {
    server_socket: UdpSocket,
    server: TraversalServer,
    clients: Vec<(TraversalClient<UdpSocket>, Recorder)>,
    /// Non-protocol datagrams seen by each client
    punches: Vec<Vec<SocketAddr>>,
}

impl Harness {
    fn new(clients: usize) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let server_socket = nonblocking_socket();
        let port = server_socket.local_addr().unwrap().port();

        let clients = (0..clients)
            .map(|_| {
                let mut client = TraversalClient::new(nonblocking_socket(), "127.0.0.1", port);
                let recorder = Recorder::default();
                client.set_handler(Box::new(recorder.clone()));
                (client, recorder)
            })
            .collect::<Vec<_>>();
        let punches = vec![Vec::new(); clients.len()];

        Harness {
            server_socket,
            server: TraversalServer::new(),
            clients,
            punches,
        }
    }

    fn step(&mut self) {
        let mut buf = [0u8; 1500];

        while let Some((len, from)) = self.server_socket.try_recv_from(&mut buf).unwrap() {
            self.server.handle_datagram(&buf[..len], from, Instant::now());
        }
        self.server.resend_packets(Instant::now());
        while let Some((to, data)) = self.server.poll_transmit() {
            Transport::send_to(&self.server_socket, &data, to).unwrap();
        }

        for (i, (client, _)) in self.clients.iter_mut().enumerate() {
            while let Some((len, from)) = client.transport().try_recv_from(&mut buf).unwrap() {
                let data = buf[..len].to_vec();
                if !client.test_packet(&data, from) && is_hole_punch(&data) {
                    self.punches[i].push(from);
                }
            }
            client.handle_resends();
        }
    }

    /// Step until `done` holds or the timeout passes
    fn run_until(&mut self, mut done: impl FnMut(&Harness) -> bool) -> bool {
        let deadline = Instant::now() + TEST_TIMEOUT;
        while Instant::now() < deadline {
            self.step();
            if done(self) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn events(&self, i: usize) -> Vec<Event> {
        self.clients[i].1 .0.borrow().clone()
    }

    fn local_addr(&self, i: usize) -> SocketAddr {
        self.clients[i].0.transport().local_addr().unwrap()
    }
}

#[test]
fn test_introduction_over_loopback() {
    let mut h = Harness::new(2);

    assert!(h.run_until(|h| h.clients.iter().all(|(c, _)| c.is_connected())));
    assert_eq!(h.server.registered_hosts(), 2);

    let a_addr = h.local_addr(0);
    let b_addr = h.local_addr(1);
    assert_eq!(h.clients[0].0.external_address(), Some(a_addr));

    let b_id = h.clients[1].0.host_id().unwrap().to_string();
    h.clients[0].0.connect_to_client(&b_id).unwrap();

    assert!(h.run_until(|h| h.events(0).iter().any(|e| matches!(e, Event::Ready(_)))));

    assert!(h.events(0).contains(&Event::Ready(b_addr)));
    // B punched toward A before the server reported ready
    assert!(h.punches[0].contains(&b_addr));
    assert!(h.clients.iter().all(|(c, _)| c.is_connected()));
}

#[test]
fn test_introduction_to_unknown_host() {
    let mut h = Harness::new(1);

    assert!(h.run_until(|h| h.clients[0].0.is_connected()));

    h.clients[0].0.connect_to_client("deadbeef").unwrap();

    assert!(h.run_until(|h| h.events(0).iter().any(|e| matches!(e, Event::Failed(_)))));
    assert!(h
        .events(0)
        .contains(&Event::Failed(ConnectFailedReason::NoSuchClient)));
    assert!(h.clients[0].0.is_connected());
}

#[test]
fn test_sessions_stay_alive_with_pings() {
    let mut h = Harness::new(1);
    assert!(h.run_until(|h| h.clients[0].0.is_connected()));

    // Well past a few ping intervals
    let until = Instant::now() + Duration::from_millis(1600);
    while Instant::now() < until {
        h.step();
        thread::sleep(Duration::from_millis(5));
    }

    assert!(h.clients[0].0.is_connected());
    assert!(h.server.stats().pings >= 3);
}
