use gbgate::config::GatewayConfig;
use gbgate::gb::{GbServer, Registry};
use gbgate::store::MemoryStore;
use gbgate::transaction::EndpointBuilder;
use gbgate::transport::{TcpListenerConnection, TransportLayer, UdpConnection};
use gbgate::webhook::{self, WebhookState};
use gbgate::zlm::MediaClient;
use gbgate::Result;
use std::net::SocketAddr;
use std::sync::{atomic::AtomicI64, Arc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let cfg = match GatewayConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("using default config ({}: {})", config_path, e);
            GatewayConfig::default()
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.log.level.clone())),
        )
        .init();

    let cancel_token = CancellationToken::new();
    let sip_addr: SocketAddr = format!("0.0.0.0:{}", cfg.sip.port).parse()?;

    // failure to bind either SIP socket is fatal
    let transport_layer = TransportLayer::new(cancel_token.child_token());
    let udp =
        UdpConnection::create_connection(sip_addr, None, Some(cancel_token.child_token())).await?;
    transport_layer.add_transport(udp.into());
    let tcp =
        TcpListenerConnection::create_listener(sip_addr, Some(cancel_token.child_token())).await?;
    transport_layer.add_transport(tcp.into());

    let endpoint = Arc::new(
        EndpointBuilder::new()
            .user_agent("gbgate/0.1")
            .transport_layer(transport_layer)
            .cancel_token(cancel_token.clone())
            .build(),
    );

    let registry = Arc::new(Registry::new());
    let store = Arc::new(MemoryStore::new());
    let zlm = Arc::new(MediaClient::new(&cfg.media));

    let gb = GbServer::new(
        cfg.sip.clone(),
        cfg.media.clone(),
        endpoint.clone(),
        registry.clone(),
        store.clone(),
        zlm.clone(),
    );

    let webhook_state = Arc::new(WebhookState {
        gb: gb.clone(),
        zlm: zlm.clone(),
        store,
        registry,
        rtmp_secret: cfg.server.rtmp_secret.clone(),
        relay_seen_at: AtomicI64::new(0),
        proxies: Default::default(),
    });
    let http_addr: SocketAddr = format!("0.0.0.0:{}", cfg.server.http_port).parse()?;
    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!(sip = %sip_addr, http = %http_addr, "gbgate starting");

    let router = webhook::router(webhook_state);
    tokio::select! {
        result = endpoint.serve() => result?,
        _ = gb.serve() => {},
        result = axum::serve(http_listener, router) => {
            result.map_err(gbgate::Error::Io)?;
        },
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            endpoint.shutdown();
        }
    }
    Ok(())
}
