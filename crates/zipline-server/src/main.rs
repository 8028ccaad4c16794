//! Zipline zipper binary.
//!
//! Serves QUIC on `--listen`. Without `--cert`/`--key` a self-signed
//! certificate for `localhost` is generated at startup.

use std::{
    fs::File,
    io::BufReader,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing_subscriber::EnvFilter;
use zipline_client::Client;
use zipline_core::{SystemEnv, auth::TokenAuth, transport::QuicTransport};
use zipline_server::{ClientDownstream, Server, ServerConfig, ServerError};

/// How long shutdown waits for clients to receive their Goaway.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(name = "zipline-server", version, about = "Zipline zipper")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:9000")]
    listen: SocketAddr,

    /// Name of this zipper
    #[arg(long, default_value = "zipper")]
    name: String,

    /// Allowed stream function name (repeatable; enables workflow mode)
    #[arg(long = "function")]
    functions: Vec<String>,

    /// Require clients to present `token:<value>`
    #[arg(long)]
    auth_token: Option<String>,

    /// Mirror data to another zipper, as `name=host:port` (repeatable)
    #[arg(long = "downstream", value_parser = parse_downstream)]
    downstreams: Vec<(String, String)>,

    /// PEM certificates trusted when dialing downstreams
    #[arg(long)]
    downstream_ca: Option<PathBuf>,

    /// PEM certificate chain
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Handshake timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    handshake_timeout_ms: u64,

    /// Close connections idle for this many milliseconds
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Redirect every client to this endpoint
    #[arg(long)]
    redirect: Option<String>,
}

fn parse_downstream(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(name, addr)| !name.is_empty() && !addr.is_empty())
        .map(|(name, addr)| (name.to_string(), addr.to_string()))
        .ok_or_else(|| format!("expected name=host:port, got {raw:?}"))
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let (certs, key) = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => (load_certs(cert)?, load_key(key)?),
        _ => self_signed()?,
    };

    let idle_timeout = args.idle_timeout_ms.map(Duration::from_millis);
    let transport = QuicTransport::server(args.listen, certs, key, idle_timeout)?;

    let mut config = ServerConfig {
        name: args.name.clone(),
        handshake_timeout: Duration::from_millis(args.handshake_timeout_ms),
        idle_timeout,
        functions: args.functions.clone(),
        redirect_to: args.redirect.clone(),
        ..ServerConfig::default()
    };
    if let Some(token) = &args.auth_token {
        config.auths.register(TokenAuth::new(token.clone()));
    }

    let server = Arc::new(Server::new(transport, SystemEnv, config));
    connect_downstreams(&server, &args)?;

    tracing::info!(listen = %args.listen, name = %args.name, "zipline-server starting");

    let serving = tokio::spawn(Arc::clone(&server).serve());
    tokio::select! {
        result = serving => {
            result.map_err(|e| ServerError::Config(format!("server task failed: {e}")))??;
        },
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupt received");
            server.shutdown().await;
            server.transport().drain(DRAIN_TIMEOUT).await;
        },
    }
    Ok(())
}

fn connect_downstreams(server: &Arc<Server<QuicTransport, SystemEnv>>, args: &Args) -> Result<(), ServerError> {
    if args.downstreams.is_empty() {
        return Ok(());
    }
    let roots = match &args.downstream_ca {
        Some(path) => load_certs(path)?,
        None => return Err(ServerError::Config("--downstream requires --downstream-ca".to_string())),
    };

    for (name, addr) in &args.downstreams {
        let transport = QuicTransport::client(roots.clone(), "localhost")?;
        let client = Client::new(transport, SystemEnv, ClientDownstream::<QuicTransport, SystemEnv>::config(&args.name));
        let link = client.clone();
        let addr = addr.clone();
        tokio::spawn(async move {
            // Failures are retried by the client's reconnect supervisor
            let _ = link.connect(&addr).await;
        });
        server.add_downstream(Arc::new(ClientDownstream::new(name.clone(), client)));
    }
    Ok(())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ServerError::Config(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| ServerError::Config(format!("no private key in {}", path.display())))
}

fn self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ServerError> {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Config(format!("certificate generation failed: {e}")))?;
    tracing::warn!("using a generated self-signed certificate for localhost");
    let key = PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der());
    Ok((vec![generated.cert.der().clone()], PrivateKeyDer::Pkcs8(key)))
}
