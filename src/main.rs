use std::sync::Arc;

use hickory_proto::op::{Message, OpCode, ResponseCode};
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::runtime::Builder;

use loafer::cache_registry::ResolverRegistry;
use loafer::config::Config;
use loafer::message;
use loafer::net::MAX_PACKET;
use loafer::resolver::LookupError;

fn usage(problem: &str) -> ! {
    eprintln!("{}", problem);
    eprintln!("usage: loafer [--threads N] <config.yaml>");
    std::process::exit(2);
}

fn main() {
    env_logger::init();

    // The whole command line: an optional worker-thread override and the
    // config file.
    let mut threads: Option<usize> = None;
    let mut config_path: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--threads" || arg == "-t" {
            match args.next().and_then(|v| v.parse::<usize>().ok()) {
                Some(n) if n > 0 => threads = Some(n),
                _ => usage("--threads expects a positive number"),
            }
        } else if arg.starts_with('-') || config_path.is_some() {
            usage(&format!("unexpected argument: {}", arg));
        } else {
            config_path = Some(arg);
        }
    }
    let Some(config_path) = config_path else {
        usage("missing config file");
    };
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => usage(&format!("failed to load {}: {}", config_path, e)),
    };

    let worker_threads = threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
    });
    debug!("runtime threads: {}", worker_threads);
    let runtime = match Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("cannot start runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async move {
        if let Err(e) = serve(config).await {
            eprintln!("fatal: {}", e);
            std::process::exit(1);
        }
    });
}

async fn serve(config: Config) -> std::io::Result<()> {
    let registry = ResolverRegistry::new();
    for net in &config.networks {
        registry.create_network_cache(net.net_id)?;
        if let Some(size) = net.cache_size {
            registry.resize_network_cache(net.net_id, size)?;
        }
        registry.set_resolver_configuration(&net.to_resolver_config())?;
    }

    let serve_net_id = config.serve_net_id();
    let socket = Arc::new(UdpSocket::bind(&config.listen).await?);
    info!(
        "serving netid {} on {}",
        serve_net_id,
        socket.local_addr()?
    );

    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        let (n, peer) = socket.recv_from(&mut buf).await?;
        let query = buf[..n].to_vec();
        let registry = registry.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            handle_query(registry, serve_net_id, socket, peer, query).await;
        });
    }
}

async fn handle_query(
    registry: Arc<ResolverRegistry>,
    net_id: u32,
    socket: Arc<UdpSocket>,
    peer: std::net::SocketAddr,
    query: Vec<u8>,
) {
    let Some(id) = message::wire_id(&query) else {
        return;
    };
    let Ok((name, qclass, qtype)) = message::question(&query) else {
        debug!("dropping unparseable query from {}", peer);
        return;
    };

    let response = match registry.resolve(net_id, &name, qclass, qtype).await {
        Ok(mut bytes) => {
            // Cached answers carry the id of whoever populated the entry.
            message::set_wire_id(&mut bytes, id);
            bytes
        }
        Err(e) => {
            let rcode = match e {
                LookupError::TryAgain => ResponseCode::ServFail,
                LookupError::NoRecord => ResponseCode::NXDomain,
            };
            match Message::error_msg(id, OpCode::Query, rcode).to_vec() {
                Ok(bytes) => bytes,
                Err(_) => return,
            }
        }
    };

    if let Err(e) = socket.send_to(&response, peer).await {
        warn!("failed to answer {}: {}", peer, e);
    }
}
