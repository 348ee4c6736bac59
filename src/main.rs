use std::sync::Arc;

use clap::Parser;
use color_eyre::{Result, eyre::eyre};
use quay::{
    DnsServer, DockerClient, EtcdClient, HttpProxy, Registry, Reloader, RevHttpProxy, SocksProxy,
    ports::ContainerRuntime,
    tracing_setup,
};
use tokio::task::JoinSet;

/// Multi-protocol redirecting proxy: HTTP, SOCKS v5 and DNS front-ends
/// over one etcd + Docker routing table.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Debug mode (verbose routing diagnostics)
    #[clap(short = 'd', long)]
    debug: bool,

    /// Emit logs as JSON instead of human-readable lines
    #[clap(long)]
    json_logs: bool,

    /// Serve the HTTP address as a reverse proxy (requires --account)
    #[clap(long)]
    reverse: bool,

    /// Fixed account name; listeners using it skip authentication
    #[clap(long)]
    account: Option<String>,

    /// Realm announced by the HTTP proxy authentication challenge
    #[clap(long, default_value = "Proxy")]
    realm: String,

    /// Password required from HTTP / SOCKS clients (any password passes
    /// when omitted)
    #[clap(long)]
    password: Option<String>,

    /// Docker Remote API address, e.g. 'http://172.17.42.1:4243' or
    /// 'unix:///var/run/docker.sock:'. Omitted: run without Docker.
    #[clap(long)]
    docker: Option<String>,

    /// etcd address the routing tree is read from
    #[clap(long, default_value = "http://172.17.42.1:4001")]
    etcd: String,

    /// Root key of the routing tree inside etcd
    #[clap(long, default_value = "/proxy")]
    routes: String,

    /// HTTP proxy listen address, e.g. '0.0.0.0:80'
    #[clap(long)]
    http: Option<String>,

    /// SOCKS v5 listen address, e.g. '0.0.0.0:1080'
    #[clap(long)]
    socks: Option<String>,

    /// DNS listen address, e.g. '0.0.0.0:53' (requires --account)
    #[clap(long)]
    dns: Option<String>,

    /// Upstream nameserver for DNS questions no route claims
    #[clap(long, default_value = "8.8.8.8:53")]
    ns: String,

    /// Override the exchange name in synthesized MX answers
    #[clap(long)]
    fakemx: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    if args.json_logs {
        tracing_setup::init_json_tracing(args.debug)?;
    } else {
        tracing_setup::init_tracing(args.debug)?;
    }

    if args.http.is_none() && args.socks.is_none() && args.dns.is_none() {
        return Err(eyre!("nothing to do: pass at least one of --http, --socks, --dns"));
    }
    if args.reverse && args.account.is_none() {
        return Err(eyre!("--reverse requires --account"));
    }
    if args.dns.is_some() && args.account.is_none() {
        return Err(eyre!("--dns requires --account"));
    }

    let registry = Arc::new(Registry::new());
    let etcd = Arc::new(EtcdClient::new(&args.etcd, &args.routes)?);
    let docker: Option<Arc<dyn ContainerRuntime>> = args
        .docker
        .as_deref()
        .map(|endpoint| Arc::new(DockerClient::new(endpoint)) as Arc<dyn ContainerRuntime>);
    if docker.is_none() {
        tracing::info!("docker endpoint not configured, container routes will be skipped");
    }

    let reloader = Arc::new(Reloader::new(registry.clone(), etcd, docker));

    // Listeners only come up once the table has been built successfully;
    // until then nobody can observe an unpopulated registry.
    reloader.initial_load().await;
    tokio::spawn(reloader.clone().run());

    let mut servers = JoinSet::new();

    if let Some(addr) = args.http.clone() {
        if args.reverse {
            let account = args.account.clone().expect("checked above");
            let proxy = Arc::new(RevHttpProxy::new(registry.clone(), account));
            servers.spawn(async move { proxy.listen_and_serve(&addr).await });
        } else {
            let mut proxy = HttpProxy::new(registry.clone());
            proxy.account_name = args.account.clone();
            proxy.password = args.password.clone();
            proxy.realm = args.realm.clone();
            let proxy = Arc::new(proxy);
            servers.spawn(async move { proxy.listen_and_serve(&addr).await });
        }
    }

    if let Some(addr) = args.socks.clone() {
        let mut proxy = SocksProxy::new(registry.clone());
        proxy.account_name = args.account.clone();
        proxy.password = args.password.clone();
        let proxy = Arc::new(proxy);
        servers.spawn(async move { proxy.listen_and_serve(&addr).await });
    }

    if let Some(addr) = args.dns.clone() {
        let account = args.account.clone().expect("checked above");
        let mut server = DnsServer::new(registry.clone(), account);
        server.name_server = args.ns.clone();
        server.fake_mx = args.fakemx.clone();
        let server = Arc::new(server);
        servers.spawn(async move { server.listen_and_serve(&addr).await });
    }

    tokio::select! {
        Some(finished) = servers.join_next() => {
            // Listener loops run forever; any return is fatal.
            match finished {
                Ok(Ok(())) => Err(eyre!("listener exited unexpectedly")),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(eyre!("listener task panicked: {e}")),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            Ok(())
        }
    }
}
