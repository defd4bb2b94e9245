use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::pin::Pin;

use anyhow::{Context, Result};
use cacheable::{logging, metrics};
use sentry::types::Dsn;

#[derive(Debug, Default)]
pub struct Config {
    pub sentry: Option<Dsn>,
    pub tracing: bool,
    pub metrics: bool,
}

#[derive(Default)]
pub struct Guard {
    sentry: Option<sentry::ClientInitGuard>,
    pub udp_sink: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// Sets up reporting for the stresstest.
///
/// Without `tracing`, logs go wherever the service configuration sends them.
///
/// # Safety
/// Must be called before any other thread is spawned, see [`logging::init_logging`].
pub unsafe fn init(config: Config, service: &cacheable::config::Config) -> Result<Guard> {
    let mut guard = Guard::default();

    if let Some(dsn) = config.sentry {
        guard.sentry = Some(sentry::init(sentry::ClientOptions {
            dsn: Some(dsn),
            release: sentry::release_name!(),
            traces_sample_rate: 1.0,
            ..Default::default()
        }));
    }

    if config.tracing {
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void:
        logging::init_json_logging("INFO,cacheable=TRACE", || NoopWriter);
    } else {
        // SAFETY: the caller guarantees that no other thread is running.
        unsafe { logging::init_logging(service) };
    }

    if config.metrics {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = UdpSocket::bind(addr).context("failed to bind metrics sink")?;
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

        metrics::configure_statsd("cacheable", host, tags)
            .context("failed to configure statsd")?;
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
