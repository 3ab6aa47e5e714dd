//! Server connector
//!
//! [`Srv`] bootstraps the serving path: resolve the bind IP from an
//! environment-derived expression, bind the listener, best-effort start a
//! loopback diagnostics endpoint, register in the directory, then serve
//! inbound gRPC until listener failure or shutdown.
//!
//! Ordering contract: the listener is bound before the directory write (the
//! advertised address is locally bindable), and the accept loop starts only
//! after the write is acknowledged, so a discovering client never races a
//! half-started server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::RoutesBuilder;
use tonic::transport::Server;
use tracing::{error, info, warn};

use farol_common::{FarolError, Result, ShutdownSignal, SHUTDOWN_OP_TIMEOUT};
use farol_directory::DirectoryStore;

use crate::registration::Registrar;

type RegisterServicesFn = Box<dyn FnOnce(&mut RoutesBuilder) + Send>;

/// gRPC server bootstrap.
pub struct Srv {
    name: String,
    ip_expr: String,
    port: u16,
    diagnostics_port: Option<u16>,
    store: Option<Arc<dyn DirectoryStore>>,
    register_services: Option<RegisterServicesFn>,
}

impl Srv {
    /// `ip_expr` is the bind-IP expression: `$VAR` reads the environment
    /// variable, a literal is parsed as an IP, and an empty string falls
    /// back to the first non-loopback interface address.
    pub fn new(name: impl Into<String>, ip_expr: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            ip_expr: ip_expr.into(),
            port,
            diagnostics_port: None,
            store: None,
            register_services: None,
        }
    }

    /// Serve a loopback Prometheus scrape endpoint on this port.
    pub fn with_diagnostics_port(mut self, port: u16) -> Self {
        self.diagnostics_port = Some(port);
        self
    }

    /// Advertise this server's bound address in the directory.
    pub fn with_registration(mut self, store: Arc<dyn DirectoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Contribute gRPC services to the router.
    pub fn with_services(mut self, f: impl FnOnce(&mut RoutesBuilder) + Send + 'static) -> Self {
        self.register_services = Some(Box::new(f));
        self
    }

    /// Bind, register, and serve until listener failure or shutdown.
    pub async fn serve(mut self, shutdown: ShutdownSignal) -> Result<()> {
        if let Some(port) = self.diagnostics_port {
            spawn_diagnostics(port);
        }

        let ip = resolve_bind_ip(&self.ip_expr)?;
        let listener = TcpListener::bind(SocketAddr::new(ip, self.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(name = %self.name, %local_addr, "listener bound");

        let mut registration = None;
        if let Some(store) = self.store.take() {
            let registrar = Registrar::new(store);
            let handle = registrar
                .register(&self.name, &local_addr.to_string(), &shutdown)
                .await?;
            registration = Some((registrar, handle));
        }

        let mut routes = RoutesBuilder::default();
        if let Some(register) = self.register_services.take() {
            register(&mut routes);
        }

        let served = Server::builder()
            .add_routes(routes.routes())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.wait())
            .await;

        if let Some((registrar, handle)) = registration {
            if shutdown.is_triggered() {
                // The renewal task deregisters on the shared token; wait it out.
                if !handle.await_stopped(SHUTDOWN_OP_TIMEOUT).await {
                    warn!(key = handle.key(), "renewal task did not stop in time");
                    registrar.deregister(&handle).await;
                }
            } else {
                // Listener failure without shutdown: clean up ourselves.
                registrar.deregister(&handle).await;
            }
        }

        served.map_err(|e| {
            error!(name = %self.name, "serve failed: {e}");
            FarolError::Other(anyhow::Error::new(e))
        })
    }
}

/// Loopback Prometheus scrape endpoint. Best effort: failure is logged and
/// the serve path continues.
fn spawn_diagnostics(port: u16) {
    tokio::spawn(async move {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            Ok(()) => info!(%addr, "diagnostics endpoint up"),
            Err(e) => warn!(%addr, "diagnostics endpoint failed to start: {e}"),
        }
    });
}

fn resolve_bind_ip(expr: &str) -> Result<IpAddr> {
    let value = match expr.strip_prefix('$') {
        Some(var) => std::env::var(var)
            .map_err(|_| FarolError::Config(format!("bind ip variable '{var}' is not set")))?,
        None => expr.to_string(),
    };
    if value.is_empty() {
        return Ok(local_ip());
    }
    value
        .parse()
        .map_err(|_| FarolError::Config(format!("'{value}' is not a bind ip")))
}

/// First non-loopback IPv4 interface address, falling back to loopback.
fn local_ip() -> IpAddr {
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|ifaces| {
            ifaces
                .into_iter()
                .filter(|iface| !iface.is_loopback())
                .find_map(|iface| match iface.addr {
                    if_addrs::IfAddr::V4(v4) => Some(IpAddr::V4(v4.ip)),
                    _ => None,
                })
        })
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
