//! Reporting of statsd metrics.
//!
//! Metrics are emitted with the [`metric!`](crate::metric) macro. Until [`configure_statsd`] was
//! called, emitting a metric does nothing.
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// Re-exports the cadence traits the [`metric!`](crate::metric) macro needs.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client that adds a fixed set of tags to everything it sends.
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd
    }

    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.tags
            .iter()
            .fold(metric, |metric, (tag, value)| metric.with_tag(tag, value))
            .send()
    }
}

/// Starts reporting metrics to the statsd server at `host`.
///
/// Every metric name is prefixed with `prefix`, and carries `tags`. The client can only be
/// configured once, later calls log a warning and keep the first client.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> io::Result<()> {
    let addrs: Vec<_> = host.to_socket_addrs()?.collect();
    let Some(first) = addrs.first() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "statsd host did not resolve",
        ));
    };
    tracing::info!(addr = %first, prefix, "Reporting metrics to statsd");

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).map_err(io::Error::other)?;
    let client = MetricsClient {
        statsd: StatsdClient::from_sink(prefix, sink),
        tags,
    };

    if CLIENT.set(client).is_err() {
        tracing::warn!("Metrics client was already configured");
    }
    Ok(())
}

/// Calls `f` with the configured client, or returns the default if there is none.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    CLIENT.get().map(f).unwrap_or_default()
}

/// Emits a metric.
///
/// ```ignore
/// metric!(counter("caches.access") += 1, "hit" => "true");
/// metric!(gauge("download.server_enabled") = 1);
/// metric!(timer("download.duration") = start.elapsed());
/// metric!(time_raw("download.size") = data.len() as u64);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags, $id, $value $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags, $id, $value $(, $k => $v)*)
    };
    // sizes are sent as timers, too
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
    (time_raw($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };

    (@send $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(client.statsd().$method($id, $value) $(.with_tag($k, $v))*);
        })
    }};
}
