//! bundle-ctl — command-line interface for bundle clients, transports,
//! and the bundled server.

use anyhow::{Context, Result};

mod cmd;

use cmd::{client, status, transport};

const DEFAULT_PORT: u16 = 9101;

fn print_usage() {
    println!("Usage: bundle-ctl [--port <port>] <command>");
    println!();
    println!("Server (talks to bundled):");
    println!("  status                         Show server status and per-client windows");
    println!("  peers                          List known clients");
    println!("  violations                     Show recent protocol violations");
    println!("  adus <peer> <app>              List inbound ADUs from a client");
    println!("  enqueue <peer> <app> <file>    Queue a file as an ADU for a client");
    println!("  shutdown                       Stop the daemon");
    println!();
    println!("Client:");
    println!("  client init [server-identity]  Create identity, optionally pin the server");
    println!("  client identity                Print this client's public identity");
    println!("  client send <app> <file>       Queue a file as an ADU");
    println!("  client sync <addr>             Exchange bundles with a server or transport");
    println!("  client inbox [app]             List received ADUs");
    println!("  client inbox <app> delete <id> Delete received ADUs through <id>");
    println!();
    println!("Transport:");
    println!("  transport serve                Serve clients and relay periodically");
    println!("  transport relay                Run one relay round with the server");
    println!();
    println!("Options:");
    println!("  --port <port>   API port of bundled (default: {})", DEFAULT_PORT);
    println!("  --json          Print sync and relay reports as JSON");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port and --json options
    let mut port = DEFAULT_PORT;
    let mut json = false;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else if args[i] == "--json" {
            json = true;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => status::cmd_status(port).await,
        ["peers"] => status::cmd_peers(port).await,
        ["violations"] => status::cmd_violations(port).await,
        ["adus", peer, app] => status::cmd_adus(port, peer, app).await,
        ["enqueue", peer, app, file] => status::cmd_enqueue(port, peer, app, file).await,
        ["shutdown"] => status::cmd_shutdown(port).await,

        ["client", "init"] => client::cmd_init(None),
        ["client", "init", server] => client::cmd_init(Some(*server)),
        ["client", "identity"] => client::cmd_identity(),
        ["client", "send", app, file] => client::cmd_send(app, file),
        ["client", "sync", addr] => client::cmd_sync(addr, json).await,
        ["client", "inbox"] => client::cmd_inbox(None),
        ["client", "inbox", app] => client::cmd_inbox(Some(*app)),
        ["client", "inbox", app, "delete", id] => client::cmd_inbox_delete(app, id),

        ["transport", "serve"] => transport::cmd_serve().await,
        ["transport", "relay"] => transport::cmd_relay(json).await,

        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
