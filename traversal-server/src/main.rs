//! Traversal Rendezvous Server
//!
//! A UDP server that:
//! - Hands out host IDs to clients that say hello
//! - Keeps each host's observed address alive while it pings
//! - Brokers hole punching between two registered hosts

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use traversal::{TraversalServer, DEFAULT_PORT};

mod metrics;

use metrics::Metrics;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on a single poll so resends run on time
const POLL_TIMEOUT: Duration = Duration::from_millis(300);

/// Default interval between stats log lines, in seconds
const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

/// Receive buffer size
const RECV_BUF_LEN: usize = 1500;

/// mio token for the UDP socket
const SOCKET_TOKEN: Token = Token(0);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --port <u16>            UDP port to listen on
    // --bind <ip>             Local address to bind
    // --stats-interval <secs> Seconds between stats log lines (0 disables)

    let port: u16 = match parse_arg(&args, "--port") {
        Some(p) => p.parse().map_err(|_| "Invalid port")?,
        None => DEFAULT_PORT,
    };
    let bind_ip: IpAddr = match parse_arg(&args, "--bind") {
        Some(ip) => ip.parse().map_err(|_| "Invalid bind address")?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let stats_interval: u64 = match parse_arg(&args, "--stats-interval") {
        Some(s) => s.parse().map_err(|_| "Invalid stats interval")?,
        None => DEFAULT_STATS_INTERVAL_SECS,
    };

    log::info!("Traversal Server starting...");
    log::info!("  Bind:  {}", SocketAddr::new(bind_ip, port));
    log::info!("  Stats: {}", if stats_interval > 0 {
        format!("every {}s", stats_interval)
    } else {
        "disabled".to_string()
    });

    // SIGINT/SIGTERM only set a flag; the loop notices within one poll timeout
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let stats_interval = if stats_interval > 0 {
        Some(Duration::from_secs(stats_interval))
    } else {
        None
    };

    let mut server = Server::new(SocketAddr::new(bind_ip, port), stats_interval)?;
    server.run(&shutdown)
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ============================================================================
// Server Structure
// ============================================================================

struct Server {
    /// mio poll instance
    poll: Poll,
    /// UDP socket
    socket: UdpSocket,
    /// Protocol state machine
    traversal: TraversalServer,
    metrics: Metrics,
    stats_interval: Option<Duration>,
    last_stats: Instant,
    /// Receive buffer
    recv_buf: Vec<u8>,
}

impl Server {
    fn new(
        bind_addr: SocketAddr,
        stats_interval: Option<Duration>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let poll = Poll::new()?;
        let mut socket = UdpSocket::bind(bind_addr)?;

        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        log::info!("Listening on {}", socket.local_addr()?);

        Ok(Server {
            poll,
            socket,
            traversal: TraversalServer::new(),
            metrics: Metrics::new(),
            stats_interval,
            last_stats: Instant::now(),
            recv_buf: vec![0u8; RECV_BUF_LEN],
        })
    }

    fn run(&mut self, shutdown: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = Events::with_capacity(1024);

        while !shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                if event.token() == SOCKET_TOKEN {
                    self.process_socket()?;
                }
            }

            // Retry unacknowledged replies
            self.traversal.resend_packets(Instant::now());

            self.send_pending();
            self.maybe_log_stats();
        }

        log::info!("Shutting down");
        self.log_stats();
        Ok(())
    }

    fn process_socket(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    log::debug!("Receive error: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            self.traversal
                .handle_datagram(&self.recv_buf[..len], from, Instant::now());
        }
        Ok(())
    }

    fn send_pending(&mut self) {
        while let Some((to, buf)) = self.traversal.poll_transmit() {
            log::trace!("Sending {} bytes to {}", buf.len(), to);
            // A lost send is covered by the resend schedule
            if let Err(e) = self.socket.send_to(&buf, to) {
                log::debug!("Send to {} failed: {}", to, e);
            }
        }
    }

    fn maybe_log_stats(&mut self) {
        let interval = match self.stats_interval {
            Some(interval) => interval,
            None => return,
        };
        if self.last_stats.elapsed() >= interval {
            self.last_stats = Instant::now();
            self.log_stats();
        }
    }

    fn log_stats(&self) {
        log::info!(
            "Stats:\n{}",
            self.metrics.render(
                &self.traversal.stats(),
                self.traversal.registered_hosts(),
                self.traversal.outstanding_requests(),
            )
        );
    }
}
