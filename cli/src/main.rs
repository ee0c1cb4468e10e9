//! chainfeed CLI: query nodes, locate blocks by time and follow the chain.
//!
//! Usage:
//! ```bash
//! # Show the current head and irreversible block
//! chainfeed info --url https://api.steemit.com
//!
//! # Send a raw JSON-RPC call
//! chainfeed call --url https://api.steemit.com --method get_block --params '[20000000]'
//!
//! # Which block was produced two hours ago?
//! chainfeed locate --rewind-secs 7200
//!
//! # Stream votes and comments as JSON lines, starting a day back
//! chainfeed follow --rewind-secs 86400 --events vote,comment
//! ```

mod logging;

use std::collections::HashMap;
use std::env;
use std::process;
use std::sync::Arc;

use chainfeed_core::{handler_fn, BlockLocator, ChainTracker, FeedBuilder, TrackerConfig};
use chainfeed_rpc::{HttpTransport, RpcClient, RpcTransport};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use logging::{init_tracing, LogConfig};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let rest = &args[2..];
    let log_config = match log_config(rest) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };
    init_tracing(&log_config);

    let result = match args[1].as_str() {
        "info" => cmd_info(rest).await,
        "call" => cmd_call(rest).await,
        "locate" => cmd_locate(rest).await,
        "follow" => cmd_follow(rest).await,
        "version" | "--version" | "-V" => {
            println!("chainfeed {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainfeed {}", env!("CARGO_PKG_VERSION"));
    println!("Follow a Steem-style chain over JSON-RPC\n");
    println!("USAGE:");
    println!("    chainfeed <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    info       Print head and last irreversible block");
    println!("    call       Send a raw JSON-RPC call");
    println!("    locate     Find the block produced at a given time");
    println!("    follow     Stream chain events as JSON lines");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("COMMON FLAGS:");
    println!("    --url <URL>            Node endpoint; repeat for fallbacks");
    println!("                           [default: https://api.steemit.com]");
    println!("    --config <FILE>        JSON tracker config (overrides --url)");
    println!("    --batch <N>            Calls per request (only for nodes that batch)");
    println!("    --parallel <N>         Requests in flight");
    println!("    --log-level <LEVEL>    trace | debug | info | warn | error");
    println!("    --log-component <C=L>  Per-crate level, e.g. chainfeed-rpc=debug; repeatable");
    println!("    --json-logs            Structured logs on stderr\n");
    println!("CALL FLAGS:");
    println!("    --method <NAME>        [required]");
    println!("    --params <JSON>        Positional params array  [default: []]\n");
    println!("LOCATE / FOLLOW FLAGS:");
    println!("    --at <RFC3339>         Target time (locate only)");
    println!("    --rewind-secs <N>      Start N seconds back; omit for the irreversible head");
    println!("    --events <A,B,..>      Event types to print (follow)  [default: block]");
}

fn log_config(args: &[String]) -> Result<LogConfig, String> {
    let mut components = HashMap::new();
    for spec in parse_all(args, "--log-component") {
        let (component, level) = spec
            .split_once('=')
            .filter(|(c, l)| !c.is_empty() && !l.is_empty())
            .ok_or_else(|| format!("--log-component expects <crate>=<level>, got '{spec}'"))?;
        components.insert(component.to_string(), level.to_string());
    }
    Ok(LogConfig {
        level: parse_flag(args, "--log-level").unwrap_or_else(|| "info".into()),
        components,
        json: has_flag(args, "--json-logs"),
    })
}

/// Tracker config from `--config`, or assembled from the flags.
fn load_config(args: &[String]) -> Result<TrackerConfig, String> {
    if let Some(path) = parse_flag(args, "--config") {
        return TrackerConfig::from_json_file(path).map_err(|e| e.to_string());
    }

    let mut builder = FeedBuilder::new();
    let urls = parse_all(args, "--url");
    if !urls.is_empty() {
        builder = builder.endpoints(urls);
    }
    if let Some(n) = parse_num(args, "--batch")? {
        builder = builder.max_batch_size(n as usize);
    }
    if let Some(n) = parse_num(args, "--parallel")? {
        builder = builder.parallel(n as usize);
    }
    if let Some(secs) = parse_num(args, "--rewind-secs")? {
        builder = builder.rewind_secs(secs);
    }
    builder.build_config().map_err(|e| e.to_string())
}

fn spawn_client(config: &TrackerConfig) -> Result<RpcClient, String> {
    let transport: Arc<dyn RpcTransport> =
        Arc::new(HttpTransport::new(&config.client.user_agent).map_err(|e| e.to_string())?);
    let (client, _driver) =
        RpcClient::spawn(config.client.clone(), transport).map_err(|e| e.to_string())?;
    Ok(client)
}

async fn cmd_info(args: &[String]) -> Result<(), String> {
    let config = load_config(args)?;
    let client = spawn_client(&config)?;

    let props = client
        .request(config.methods.global_properties.as_str(), vec![])
        .await
        .map_err(|e| e.to_string())?;

    println!("  Endpoint:     {}", config.client.endpoints[0]);
    println!("  Head block:   {}", props["head_block_number"]);
    println!("  Irreversible: {}", props[config.methods.irreversible_field.as_str()]);
    println!("  Head time:    {}", props["time"].as_str().unwrap_or("?"));
    client.shutdown();
    Ok(())
}

async fn cmd_call(args: &[String]) -> Result<(), String> {
    let config = load_config(args)?;
    let method = parse_flag(args, "--method").ok_or("--method is required")?;
    let params = match parse_flag(args, "--params") {
        Some(raw) => {
            let parsed: Value =
                serde_json::from_str(&raw).map_err(|e| format!("--params: {e}"))?;
            match parsed {
                Value::Array(items) => items,
                other => vec![other],
            }
        }
        None => vec![],
    };

    let client = spawn_client(&config)?;
    let result = client.request(method, params).await.map_err(|e| e.to_string())?;
    println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
    client.shutdown();
    Ok(())
}

async fn cmd_locate(args: &[String]) -> Result<(), String> {
    let config = load_config(args)?;
    let target: Option<DateTime<Utc>> = match parse_flag(args, "--at") {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| format!("--at: {e}"))?
                .with_timezone(&Utc),
        ),
        None => config.rewind_target(Utc::now()).map_err(|e| e.to_string())?,
    };

    let client = spawn_client(&config)?;
    let locator = BlockLocator::new(client.clone(), config.methods.clone());
    let block = locator.locate(target).await.map_err(|e| e.to_string())?;

    match target {
        Some(t) => println!("Block {block} (at or just before {t})"),
        None => println!("Block {block} (last irreversible)"),
    }
    client.shutdown();
    Ok(())
}

async fn cmd_follow(args: &[String]) -> Result<(), String> {
    let config = load_config(args)?;
    let events: Vec<String> = parse_flag(args, "--events")
        .unwrap_or_else(|| "block".into())
        .split(',')
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();

    let transport: Arc<dyn RpcTransport> =
        Arc::new(HttpTransport::new(&config.client.user_agent).map_err(|e| e.to_string())?);
    let (tracker, driver) = ChainTracker::spawn(config, transport).map_err(|e| e.to_string())?;

    for event in &events {
        let name = event.clone();
        tracker.register(
            event,
            "stdout",
            handler_fn(move |timestamp, payload, _| {
                println!("{}", json!({"event": name, "timestamp": timestamp, "payload": payload}));
                Ok(())
            }),
        );
    }

    let start = tracker.start().await.map_err(|e| e.to_string())?;
    eprintln!("Following from block {start}; Ctrl-C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            let cursor = tracker.snapshot();
            tracing::info!(
                blocks = tracker.blocks_dispatched(),
                last_requested = cursor.last_requested,
                synced = cursor.synced,
                "stopping"
            );
            tracker.shutdown();
        }
        _ = driver => {}
    }
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn parse_all(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|w| w[0] == flag)
        .map(|w| w[1].clone())
        .collect()
}

fn parse_num(args: &[String], flag: &str) -> Result<Option<u64>, String> {
    parse_flag(args, flag)
        .map(|v| v.parse::<u64>().map_err(|_| format!("{flag} expects a number, got '{v}'")))
        .transpose()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
