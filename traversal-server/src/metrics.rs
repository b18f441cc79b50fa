//! Prometheus-style rendering of the rendezvous server counters.
//!
//! The server logs the rendered text at the stats interval and once more on
//! shutdown.

use std::time::Instant;

use traversal::ServerStats;

pub struct Metrics {
    /// Server start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(
        &self,
        stats: &ServerStats,
        registered_hosts: usize,
        outstanding: usize,
    ) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP traversal_registered_hosts Host IDs currently registered\n\
             # TYPE traversal_registered_hosts gauge\n\
             traversal_registered_hosts {}\n\
             # HELP traversal_outstanding_requests Sent packets awaiting an Ack\n\
             # TYPE traversal_outstanding_requests gauge\n\
             traversal_outstanding_requests {}\n\
             # HELP traversal_datagrams_received_total Datagrams received\n\
             # TYPE traversal_datagrams_received_total counter\n\
             traversal_datagrams_received_total {}\n\
             # HELP traversal_datagrams_dropped_total Datagrams too short to decode\n\
             # TYPE traversal_datagrams_dropped_total counter\n\
             traversal_datagrams_dropped_total {}\n\
             # HELP traversal_hosts_registered_total Host IDs handed out\n\
             # TYPE traversal_hosts_registered_total counter\n\
             traversal_hosts_registered_total {}\n\
             # HELP traversal_version_rejections_total Hellos rejected for protocol version\n\
             # TYPE traversal_version_rejections_total counter\n\
             traversal_version_rejections_total {}\n\
             # HELP traversal_pings_total Keepalive pings received\n\
             # TYPE traversal_pings_total counter\n\
             traversal_pings_total {}\n\
             # HELP traversal_unknown_pings_total Pings for unregistered host IDs\n\
             # TYPE traversal_unknown_pings_total counter\n\
             traversal_unknown_pings_total {}\n\
             # HELP traversal_connect_requests_total Introduction requests received\n\
             # TYPE traversal_connect_requests_total counter\n\
             traversal_connect_requests_total {}\n\
             # HELP traversal_connects_ready_total Introductions completed\n\
             # TYPE traversal_connects_ready_total counter\n\
             traversal_connects_ready_total {}\n\
             # HELP traversal_connects_failed_total Introductions failed\n\
             # TYPE traversal_connects_failed_total counter\n\
             traversal_connects_failed_total {}\n\
             # HELP traversal_resends_total Packets resent for lack of an Ack\n\
             # TYPE traversal_resends_total counter\n\
             traversal_resends_total {}\n\
             # HELP traversal_expired_requests_total Requests dropped after the last try\n\
             # TYPE traversal_expired_requests_total counter\n\
             traversal_expired_requests_total {}\n\
             # HELP traversal_uptime_seconds Server uptime in seconds\n\
             # TYPE traversal_uptime_seconds gauge\n\
             traversal_uptime_seconds {}\n",
            registered_hosts,
            outstanding,
            stats.datagrams_received,
            stats.datagrams_dropped,
            stats.hosts_registered,
            stats.version_rejections,
            stats.pings,
            stats.unknown_pings,
            stats.connect_requests,
            stats.connects_ready,
            stats.connects_failed,
            stats.resends,
            stats.expired_requests,
            uptime,
        )
    }
}
