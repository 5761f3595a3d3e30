//! enclave-rpc CLI — drives a simulated trusted node end to end
//!
//! Commands:
//!   enclave-rpc demo            — attest, negotiate, start a directory, call, replay, stop
//!   enclave-rpc report          — print a report for the simulated quoting enclave
//!   enclave-rpc config [path]   — print the effective node configuration
//!   enclave-rpc status          — print a node status snapshot after attestation

use enclave_rpc::server::directory::{decode_reply, encode_query, DirectoryCallArgs};
use enclave_rpc::server::{DirectoryServer, DirectoryStartArgs};
use enclave_rpc::tee::platform::{Platform, SIGN_TYPE_LINKABLE};
use enclave_rpc::{
    ChannelReplySink, ClientHandshake, Enclave, MessageTag, NodeConfig, Reply, ReplyBody,
    ServerHandle, SimulatedPlatform, TrustBoundary,
};
use std::env;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const CONFIG_ENV: &str = "ENCLAVE_RPC_CONFIG";

type DirectoryNode = Enclave<DirectoryServer>;

fn print_usage() {
    println!(
        r#"
╔══════════════════════════════════════════════════════════════╗
║        enclave-rpc — attested RPC across a trust boundary    ║
╚══════════════════════════════════════════════════════════════╝

Usage: enclave-rpc <command> [options]

Commands:
  demo              Run the full protocol against a simulated enclave
  report            Print a report targeted at the quoting enclave
  config [path]     Print the effective configuration as JSON
  status            Print a node status snapshot
  help              Show this message

Configuration is read from [path] or ${} (JSON); defaults otherwise.
"#,
        CONFIG_ENV
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    match args[1].as_str() {
        "demo" => cmd_demo().await,
        "report" => cmd_report(),
        "config" => cmd_config(&args[2..]),
        "status" => cmd_status(),
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
        }
    }
}

/// Config from an explicit path, then the environment, then defaults
fn load_config(path: Option<&str>) -> Option<NodeConfig> {
    let path = path.map(str::to_string).or_else(|| env::var(CONFIG_ENV).ok());
    match path {
        Some(path) => match NodeConfig::from_file(&path) {
            Ok(config) => {
                println!("  Loaded configuration from {}", path);
                Some(config)
            }
            Err(e) => {
                eprintln!("  {}", e);
                None
            }
        },
        None => Some(NodeConfig::default()),
    }
}

/// Initialized node with a committed quote, plus the raw quote bytes
fn attested_node(
    config: NodeConfig,
) -> Option<(DirectoryNode, Vec<u8>, tokio::sync::mpsc::UnboundedReceiver<Reply>)> {
    let (sink, rx) = ChannelReplySink::channel();
    let platform = SimulatedPlatform::development();
    let node = Enclave::new(platform.clone(), Arc::new(sink));

    if let Err(e) = node.node_init(config) {
        eprintln!("  node_init failed: {}", e);
        return None;
    }
    let report = match node.get_next_report(&platform.quoting_target()) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("  get_next_report failed: {}", e);
            return None;
        }
    };
    let quote = match platform.quote(&report, SIGN_TYPE_LINKABLE) {
        Ok(quote) => quote,
        Err(e) => {
            eprintln!("  Quoting failed: {}", e);
            return None;
        }
    };
    match node.commit_quote(&quote) {
        Ok(version) => println!("  Committed quote {} ({} bytes)", version, quote.len()),
        Err(e) => {
            eprintln!("  commit_quote failed: {}", e);
            return None;
        }
    }
    Some((node, quote, rx))
}

async fn cmd_demo() {
    println!(
        r#"
╔══════════════════════════════════════════════════════════════╗
║              enclave-rpc — Full Demo                         ║
║     Attest + Negotiate + Sealed Directory Lookups            ║
╚══════════════════════════════════════════════════════════════╝
"#
    );

    let config = match load_config(None) {
        Some(config) => config,
        None => return,
    };

    // Step 1: Node init + attestation
    println!("Step 1: Initializing node and committing a quote...");
    println!("{}", "-".repeat(60));
    let (node, quote, mut rx) = match attested_node(config) {
        Some(parts) => parts,
        None => return,
    };
    println!(
        "  MRENCLAVE:       {}...",
        &hex::encode(node.platform().identity().mr_enclave)[..16]
    );

    // Replies arrive asynchronously; a task drains them until the node goes away
    let drainer: JoinHandle<Vec<Reply>> = tokio::spawn(async move {
        let mut replies = Vec::new();
        while let Some(reply) = rx.recv().await {
            replies.push(reply);
        }
        replies
    });

    // Step 2: Client negotiation
    println!("\nStep 2: Negotiating a client session...");
    println!("{}", "-".repeat(60));
    let (handshake, request) = ClientHandshake::initiate();
    let response = match node.negotiate(&request) {
        Ok(response) => response,
        Err(e) => {
            eprintln!("  negotiate failed: {}", e);
            return;
        }
    };
    let mut session = match handshake
        .expect_identity(*node.platform().identity())
        .finish(&response, &quote)
    {
        Ok(session) => session,
        Err(e) => {
            eprintln!("  Handshake rejected: {}", e);
            return;
        }
    };
    println!("  Session:         {}", session.session_id());
    println!("  Bound to quote:  {}", session.quote_version());

    // Step 3: Server lifecycle
    println!("\nStep 3: Starting a sealed directory...");
    println!("{}", "-".repeat(60));
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let start = || DirectoryStartArgs {
        entries: vec![(15551234567, alice), (15557654321, bob)],
        max_query: 64,
    };
    let handle = ServerHandle(1);
    if let Err(e) = node.server_start(start(), handle) {
        eprintln!("  server_start failed: {}", e);
        return;
    }
    println!("  Server {} running", handle);
    match node.server_start(start(), handle) {
        Ok(()) => println!("  Second start unexpectedly succeeded"),
        Err(e) => println!("  Second start:    {}", e),
    }

    // Step 4: Calls
    println!("\nStep 4: Tagged calls...");
    println!("{}", "-".repeat(60));
    let phones: [u64; 3] = [15551234567, 15550000000, 15557654321];
    let envelope = match session.seal_request(&encode_query(&phones)) {
        Ok(envelope) => envelope,
        Err(e) => {
            eprintln!("  seal failed: {}", e);
            return;
        }
    };
    let call_args = DirectoryCallArgs {
        query_count: phones.len() as u32,
    };
    match node.server_call(&call_args, &envelope, MessageTag(42), handle) {
        Ok(()) => println!("  Call #42 accepted (counter {})", envelope.header.counter),
        Err(e) => eprintln!("  Call #42 rejected: {}", e),
    }
    match node.server_call(&call_args, &envelope, MessageTag(43), handle) {
        Ok(()) => println!("  Replay unexpectedly accepted"),
        Err(e) => println!("  Replay #43:      {}", e),
    }

    // Step 5: Stop
    println!("\nStep 5: Stopping the directory...");
    println!("{}", "-".repeat(60));
    match node.server_stop((), handle) {
        Ok(()) => println!("  Server {} stopped", handle),
        Err(e) => eprintln!("  server_stop failed: {}", e),
    }
    if let Ok(late) = session.seal_request(&encode_query(&phones)) {
        match node.server_call(&call_args, &late, MessageTag(44), handle) {
            Ok(()) => println!("  Call after stop unexpectedly accepted"),
            Err(e) => println!("  Call #44:        {}", e),
        }
    }
    let status = node.status();
    drop(node);

    // Step 6: Collect replies
    println!("\nStep 6: Opening replies...");
    println!("{}", "-".repeat(60));
    let replies = match drainer.await {
        Ok(replies) => replies,
        Err(e) => {
            eprintln!("  Reply task failed: {}", e);
            return;
        }
    };
    for reply in &replies {
        match session.open_reply(reply, envelope.header.counter) {
            Ok(ReplyBody::Ok(payload)) => {
                let uuids = decode_reply(&payload).unwrap_or_default();
                println!("  Reply {}:", reply.tag);
                for (phone, uuid) in phones.iter().zip(uuids) {
                    let name = if uuid == alice {
                        "alice"
                    } else if uuid == bob {
                        "bob"
                    } else {
                        "-"
                    };
                    println!("    {} → {} ({})", phone, uuid, name);
                }
            }
            Ok(other) => println!("  Reply {}: {:?}", reply.tag, other),
            Err(e) => eprintln!("  Reply {} rejected: {}", reply.tag, e),
        }
    }

    println!("\n  Replies delivered: {}", replies.len());
    println!("  Active sessions:   {}", status.active_sessions);
    println!("  Running servers:   {}", status.running_servers.len());
}

fn cmd_report() {
    let config = match load_config(None) {
        Some(config) => config,
        None => return,
    };
    let (sink, _rx) = ChannelReplySink::channel();
    let platform = SimulatedPlatform::development();
    let node: DirectoryNode = Enclave::new(platform.clone(), Arc::new(sink));
    if let Err(e) = node.node_init(config) {
        eprintln!("  node_init failed: {}", e);
        return;
    }

    let target = platform.quoting_target();
    match node.get_next_report(&target) {
        Ok(report) => {
            println!("\n  Report");
            println!("  {}", "=".repeat(40));
            println!("  Target:          {}...", &hex::encode(target.mr_enclave)[..16]);
            println!("  MRENCLAVE:       {}...", &hex::encode(report.body.mr_enclave)[..16]);
            println!("  MRSIGNER:        {}...", &hex::encode(report.body.mr_signer)[..16]);
            println!("  ISV SVN:         {}", report.body.isv_svn);
            println!("  Node key:        {}", hex::encode(&report.body.report_data[..32]));
            println!("  MAC valid:       {}", platform.verify_report(&target, &report));
            println!("  Bytes:           {}", hex::encode(report.to_bytes()));
        }
        Err(e) => eprintln!("  get_next_report failed: {}", e),
    }
}

fn cmd_config(args: &[String]) {
    let config = match load_config(args.first().map(|s| s.as_str())) {
        Some(config) => config,
        None => return,
    };
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("  Failed to render config: {}", e),
    }
}

fn cmd_status() {
    let config = match load_config(None) {
        Some(config) => config,
        None => return,
    };
    let (node, _, _rx) = match attested_node(config) {
        Some(parts) => parts,
        None => return,
    };
    match serde_json::to_string_pretty(&node.status()) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("  Failed to render status: {}", e),
    }
}
