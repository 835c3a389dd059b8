use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::pin::Pin;

use anyhow::Result;
use infocache::logging::init_logging;
use infocache::{Config as InfocacheConfig, metrics};
use tracing_subscriber::fmt::fmt;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

#[derive(Debug, Default)]
pub struct Config {
    pub tracing: bool,
    pub metrics: bool,
}

#[derive(Default)]
pub struct Guard {
    pub udp_sink: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// Sets up logging and metrics for a stresstest run.
///
/// # Safety
/// This may modify the environment, so it must only be called while the process is single-threaded.
pub unsafe fn init(config: Config, config_file: &InfocacheConfig) -> Result<Guard> {
    let mut guard = Guard::default();

    if config.tracing {
        if config_file.logging.enable_backtraces {
            // SAFETY: As documented, this function may only be called in a single-threaded context.
            unsafe { env::set_var("RUST_BACKTRACE", "1") };
        }

        // all the tracing machinery should be active without spamming the console,
        // so everything is formatted like in production and then dropped:
        fmt()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true)
            .with_env_filter("INFO,infocache=TRACE,infocache_stress=TRACE")
            .with_writer(|| NoopWriter)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .finish()
            .init();
    } else {
        // SAFETY: Forwarded from our own contract.
        unsafe { init_logging(&config_file.logging) };
    }

    if config.metrics {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = UdpSocket::bind(addr)?;
        listener.set_nonblocking(true)?;
        let socket = listener.local_addr()?;

        guard.udp_sink = Some(Box::pin(async move {
            let Ok(listener) = tokio::net::UdpSocket::from_std(listener) else {
                return;
            };
            let mut buf = Vec::with_capacity(1024);
            loop {
                buf.clear();
                if listener.recv_buf(&mut buf).await.is_err() {
                    break;
                }
            }
        }));

        let host = format!("127.0.0.1:{}", socket.port());

        // have some default tags, just to be closer to the real world config
        let mut tags = BTreeMap::new();
        tags.insert("host".into(), "stresstest".into());
        tags.insert("env".into(), "stresstest".into());

        metrics::configure_statsd(&config_file.metrics.prefix, host, tags)?;
    } else if let Some(ref statsd) = config_file.metrics.statsd {
        metrics::configure_statsd(
            &config_file.metrics.prefix,
            statsd.as_str(),
            config_file.metrics.custom_tags.clone(),
        )?;
    }

    Ok(guard)
}

struct NoopWriter;
impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
