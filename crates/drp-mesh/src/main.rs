// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DRP mesh node
//!
//! Runs one node of the mesh with any mix of roles.
//!
//! # Usage
//!
//! ```bash
//! # Registry + Broker listening on 8080
//! drp-node --node-id reg1 --roles Registry,Broker --port 8080
//!
//! # Provider in zone "west" with the demo Greeter service and dummy stream
//! drp-node --node-id prov1 --zone west --registry ws://reg1:8080/ --demo
//!
//! # Using a configuration file
//! drp-node --config node.toml
//! ```

use clap::{Parser, Subcommand};
use drp_mesh::auth::{AuthenticatorService, StaticAuthenticator};
use drp_mesh::service::FnService;
use drp_mesh::{Node, NodeConfig, NodeServer, Role, Scope, WsConnector};
use serde_json::json;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Name the demo authenticator service is registered under.
const DEMO_AUTHENTICATOR: &str = "Authenticator";

/// DRP mesh node - registry, broker, provider and relay roles
#[derive(Parser, Debug)]
#[command(name = "drp-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node identifier (must be unique in the mesh)
    #[arg(long)]
    node_id: Option<String>,

    /// Roles (comma-separated): Registry, Broker, Provider, Relay, ...
    #[arg(short, long, value_delimiter = ',')]
    roles: Option<Vec<Role>>,

    /// Zone name
    #[arg(short, long)]
    zone: Option<String>,

    /// Mesh domain
    #[arg(long)]
    domain: Option<String>,

    /// Pre-shared mesh key
    #[arg(long)]
    mesh_key: Option<String>,

    /// Listener port (omit for an outbound-only node)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// URL other nodes should use to reach this one
    #[arg(long)]
    url: Option<String>,

    /// Registry URLs to join (comma-separated, tried in order)
    #[arg(long, value_delimiter = ',')]
    registry: Option<Vec<String>>,

    /// Host the demo Greeter service and publish the "dummy" stream
    #[arg(long)]
    demo: bool,

    /// Require consumers to log in (demo user "demo" / password "demo")
    #[arg(long)]
    demo_auth: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "node.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    if let Some(cmd) = &args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = build_config(&args)?;
    config.validate()?;
    print_banner(&config);

    let node = Node::new(config, Arc::new(WsConnector))?;

    if args.demo_auth {
        let auth = StaticAuthenticator::new().with_user("demo", "demo", "Demo User", &["users"]);
        node.add_service(Arc::new(AuthenticatorService::new(
            DEMO_AUTHENTICATOR,
            Arc::new(auth),
        )))
        .await;
    }
    if args.demo {
        start_demo(&node).await?;
    }

    let shutdown_node = node.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping node...");
        shutdown_node.shutdown();
    });

    let _mesh = if node.config().registry_urls.is_empty() {
        None
    } else {
        Some(node.connect_to_mesh()?)
    };

    if node.config().port.is_some() {
        let server = NodeServer::new(node.clone());
        if let Err(e) = server.run().await {
            error!("Listener failed: {}", e);
            node.shutdown();
            return Err(e.into());
        }
    } else {
        node.shutdown_signal().await;
    }

    info!("Node {} stopped", node.id());
    Ok(())
}

fn build_config(args: &Args) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            NodeConfig::from_file(path)?
        }
        None => NodeConfig::default(),
    };

    if let Some(node_id) = &args.node_id {
        config.node_id = node_id.clone();
    }
    if let Some(roles) = &args.roles {
        config.roles = roles.clone();
    }
    if let Some(zone) = &args.zone {
        config.zone = zone.clone();
    }
    if args.domain.is_some() {
        config.domain = args.domain.clone();
    }
    if args.mesh_key.is_some() {
        config.mesh_key = args.mesh_key.clone();
    }
    if args.port.is_some() {
        config.port = args.port;
    }
    if let Some(bind) = args.bind {
        config.listen_address = bind;
    }
    if args.url.is_some() {
        config.listening_url = args.url.clone();
    }
    if let Some(registry) = &args.registry {
        config.registry_urls = registry.clone();
    }
    if args.demo_auth {
        config.authenticator_service = Some(DEMO_AUTHENTICATOR.to_string());
    }

    if config.listening_url.is_none() {
        if let Some(port) = config.port {
            let host = std::env::var("HOSTNAME")
                .ok()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "localhost".to_string());
            config.listening_url = Some(format!("ws://{}:{}{}", host, port, config.ws_route));
        }
    }
    Ok(config)
}

fn print_banner(config: &NodeConfig) {
    let roles = config
        .roles
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let listen = match config.port {
        Some(port) => format!("{}:{}{}", config.listen_address, port, config.ws_route),
        None => "none (outbound only)".to_string(),
    };
    let registry = if config.registry_urls.is_empty() {
        "none".to_string()
    } else {
        config.registry_urls.join(",")
    };

    info!("+----------------------------------------------------+");
    info!(
        "|       DRP Mesh Node v{}                        |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Node:     {:39} |", config.node_id);
    info!("|  Roles:    {:39} |", roles);
    info!("|  Zone:     {:39} |", config.zone);
    info!(
        "|  Domain:   {:39} |",
        config.domain.as_deref().unwrap_or("none")
    );
    info!("|  Listen:   {:39} |", listen);
    info!("|  Registry: {:39} |", registry);
    info!("+----------------------------------------------------+");
}

/// Greeter service plus a `dummy` stream fed every few seconds.
async fn start_demo(node: &Arc<Node>) -> Result<(), Box<dyn std::error::Error>> {
    let greeter = FnService::builder("Greeter")
        .service_type("Greeter")
        .scope(Scope::Global)
        .command("sayHi", |_params, ctx| async move {
            Ok(json!({ "pathItem": format!("Hello from {}", ctx.node_id) }))
        })
        .command("showParams", |params, _ctx| async move {
            Ok(json!({ "pathItem": params }))
        })
        .build();
    node.add_service(Arc::new(greeter)).await;
    node.add_stream("dummy", "Test stream").await?;

    let publisher = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3));
        let mut seq: u64 = 0;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = publisher.shutdown_signal() => break,
            }
            seq += 1;
            let payload = json!({
                "seq": seq,
                "from": publisher.id(),
                "time": chrono::Utc::now().to_rfc3339(),
            });
            publisher.send_to_topic("dummy", payload);
        }
    });
    info!("Demo Greeter service and dummy stream started");
    Ok(())
}

fn cmd_gen_config(output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig {
        node_id: "provider-1".into(),
        roles: vec![Role::Provider, Role::Broker],
        zone: "west".into(),
        domain: Some("example".into()),
        mesh_key: Some("change-me".into()),
        port: Some(8080),
        listening_url: Some("ws://provider-1:8080/".into()),
        registry_urls: vec!["ws://registry-1:8080/".into()],
        ..Default::default()
    };

    let content = format!(
        r#"# DRP Mesh Node Configuration
# Generated by drp-node gen-config

{}
"#,
        config.to_toml_string()?
    );

    std::fs::write(output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let result = NodeConfig::from_file(config_path).and_then(|config| {
        config.validate()?;
        Ok(config)
    });
    match result {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Node:       {}", config.node_id);
            println!("Roles:      {:?}", config.roles);
            println!("Zone:       {}", config.zone);
            println!(
                "Listener:   {}",
                config
                    .port
                    .map(|p| format!("{}:{}", config.listen_address, p))
                    .unwrap_or_else(|| "none".into())
            );
            println!("Registries: {}", config.registry_urls.len());
            if config.mesh_key.is_none() {
                warn!("No mesh_key set; any node in the domain can join");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}
