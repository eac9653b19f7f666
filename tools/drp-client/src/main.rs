// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! drp-client - talk to a DRP mesh through a broker
//!
//! ```bash
//! drp-client --url ws://localhost:8080/ path Mesh/Services --list
//! drp-client cmd Greeter sayHi
//! drp-client watch dummy --scope zone -n 10
//! ```

use chrono::Local;
use clap::{Parser, Subcommand};
use colored::*;
use drp_mesh::auth::AuthRequest;
use drp_mesh::{Consumer, Scope, WsConnector};
use serde_json::Value;
use std::io::{self, IsTerminal, Write};
use std::time::Duration;

/// Consumer client for a DRP mesh broker
#[derive(Parser, Debug)]
#[command(name = "drp-client")]
#[command(version)]
#[command(about = "Run commands and watch streams through a DRP broker")]
struct Args {
    /// Broker URL
    #[arg(short, long, default_value = "ws://localhost:8080/")]
    url: String,

    /// User name for brokers with an authenticator
    #[arg(long, requires = "password")]
    user: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Session token instead of user/password
    #[arg(long, conflicts_with = "user")]
    token: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Print compact JSON only
    #[arg(long)]
    json: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a command path, e.g. Services/Greeter/ClientCmds/sayHi
    Path {
        /// Slash-separated path ("" for the root)
        #[arg(default_value = "")]
        path: String,

        /// List children instead of executing
        #[arg(short, long)]
        list: bool,

        /// JSON parameters
        #[arg(short, long)]
        params: Option<String>,
    },

    /// Call a service method on the best provider
    Cmd {
        service: String,
        method: String,

        /// JSON parameters
        #[arg(short, long)]
        params: Option<String>,
    },

    /// List commands reachable through the broker
    Cmds,

    /// Watch a stream
    Watch {
        topic: String,

        /// local, zone or global
        #[arg(short, long, default_value = "global")]
        scope: Scope,

        /// Stop after this many messages (0 = unlimited)
        #[arg(short = 'n', long, default_value = "0")]
        count: u64,
    },

    /// Print the broker's topology view
    Topology,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.no_color || !io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(&args).await {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let auth = match (&args.user, &args.password, &args.token) {
        (Some(user), Some(password), _) => Some(AuthRequest::password(user, password)),
        (_, _, Some(token)) => Some(AuthRequest::token(token)),
        _ => None,
    };
    let consumer = Consumer::connect(
        &WsConnector,
        &args.url,
        auth,
        Duration::from_secs(args.timeout),
    )
    .await?;

    if !args.json {
        eprintln!(
            "{} {} {} (zone {})",
            ">>>".green().bold(),
            "Connected to".bold(),
            consumer.broker().node_id.cyan(),
            consumer.broker().zone
        );
        if let Some(user) = consumer.user() {
            eprintln!("    as {} ({})", user.user_name.cyan(), user.full_name);
        }
    }

    match &args.command {
        Command::Path { path, list, params } => {
            let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
            let value = consumer
                .path_cmd(&segments, *list, parse_params(params.as_deref())?)
                .await?;
            if *list && !args.json {
                print_listing(&value);
            } else {
                print_value(&value, args.json);
            }
        }
        Command::Cmd {
            service,
            method,
            params,
        } => {
            let value = consumer
                .service_command(service, method, parse_params(params.as_deref())?)
                .await?;
            print_value(&value, args.json);
        }
        Command::Cmds => {
            let value = consumer.get_cmds().await?;
            if args.json {
                print_value(&value, true);
            } else {
                print_cmds(&value);
            }
        }
        Command::Watch {
            topic,
            scope,
            count,
        } => watch(&consumer, topic, *scope, *count, args.json).await?,
        Command::Topology => {
            let topology = consumer.topology().await?;
            if args.json {
                print_value(&serde_json::to_value(&topology)?, true);
            } else {
                println!("{}", "Nodes".bold());
                for node in &topology.nodes {
                    println!(
                        "  {:20} zone={:10} roles={:?} via={}",
                        node.node_id.cyan(),
                        node.zone,
                        node.roles,
                        node.learned_from.as_deref().unwrap_or("-")
                    );
                }
                println!("{}", "Services".bold());
                for svc in &topology.services {
                    println!(
                        "  {:20} on {:16} scope={} priority={}",
                        svc.name.cyan(),
                        svc.node_id,
                        svc.scope,
                        svc.priority
                    );
                }
                println!("{}", "Streams".bold());
                for stream in &topology.streams {
                    println!(
                        "  {:20} on {:16} scope={}",
                        stream.topic.cyan(),
                        stream.node_id,
                        stream.scope
                    );
                }
            }
        }
    }

    consumer.close();
    Ok(())
}

async fn watch(
    consumer: &Consumer,
    topic: &str,
    scope: Scope,
    max: u64,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut sub = consumer.watch_stream(topic, scope).await?;
    if !json {
        eprintln!(
            "{} {} {} (scope={})",
            ">>>".green().bold(),
            "Watching".bold(),
            topic.cyan(),
            scope
        );
        eprintln!("{}", "Press Ctrl+C to stop".dimmed());
        eprintln!();
    }

    let mut received: u64 = 0;
    loop {
        let next = tokio::select! {
            next = sub.recv() => next,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(value) = next else {
            if let Some(reason) = sub.close_reason() {
                eprintln!("{}: stream closed: {}", "Warning".yellow(), reason);
            }
            break;
        };
        received += 1;
        if json {
            println!("{}", value);
        } else {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            println!(
                "{} {}",
                format!("[{}]", timestamp).dimmed(),
                format!("#{}", received).yellow()
            );
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        let _ = io::stdout().flush();
        if max > 0 && received >= max {
            break;
        }
    }
    sub.unsubscribe();

    if !json {
        eprintln!("\n{} Received {} message(s)", "---".dimmed(), received);
    }
    Ok(())
}

fn parse_params(raw: Option<&str>) -> Result<Value, serde_json::Error> {
    match raw {
        Some(text) => serde_json::from_str(text),
        None => Ok(Value::Null),
    }
}

fn print_value(value: &Value, compact: bool) {
    if compact {
        println!("{}", value);
    } else {
        println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        );
    }
}

fn print_listing(value: &Value) {
    let Some(items) = value["pathItemList"].as_array() else {
        print_value(value, false);
        return;
    };
    if items.is_empty() {
        println!("  {}", "(empty)".dimmed());
    }
    for item in items {
        let name = item["Name"].as_str().unwrap_or("?");
        let kind = item["Type"].as_str().unwrap_or("?");
        match &item["Value"] {
            Value::Null => println!("  {:24} {}", name.cyan(), kind.dimmed()),
            v => println!("  {:24} {} {}", name.cyan(), kind.dimmed(), v),
        }
    }
}

fn print_cmds(value: &Value) {
    let Some(services) = value.as_object() else {
        print_value(value, false);
        return;
    };
    for (service, cmds) in services {
        println!("{}", service.bold());
        for cmd in cmds.as_array().into_iter().flatten() {
            println!("  {}", cmd.as_str().unwrap_or("?").green());
        }
    }
}
