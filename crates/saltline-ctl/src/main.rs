//! saltline-ctl — minion-side command line for a saltline master.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use saltline_channel::keys::{KeyAuthority, KeyState};
use saltline_channel::pub_client::AsyncPubChannel;
use saltline_channel::req_client::{AsyncReqChannel, ChannelOptions, ChannelRegistry};
use saltline_channel::transport::TransportFactory;
use saltline_core::config::{Crypt, SaltlineConfig, TransportKind};
use saltline_core::payload::{load_from_pairs, Load};
use saltline_transport::{InMemoryBroker, Transports};

// ── Options ───────────────────────────────────────────────────────────────────

struct Cli {
    config: SaltlineConfig,
    pretty: bool,
}

fn parse_transport(v: &str) -> Result<TransportKind> {
    Ok(match v {
        "tcp" => TransportKind::Tcp,
        "http" => TransportKind::Http,
        "mq" => TransportKind::Mq,
        other => bail!("unknown transport {other:?} (expected tcp, http or mq)"),
    })
}

fn parse_crypt(v: &str) -> Result<Crypt> {
    Ok(match v {
        "aes" => Crypt::Aes,
        "clear" => Crypt::Clear,
        other => bail!("unknown crypt {other:?} (expected aes or clear)"),
    })
}

/// `key=value` words into a load.
fn pairs_to_load(words: &[&str]) -> Result<Load> {
    let mut pairs = Vec::with_capacity(words.len());
    for word in words {
        let (k, v) = word
            .split_once('=')
            .with_context(|| format!("expected key=value, got {word:?}"))?;
        pairs.push((k, v));
    }
    Ok(load_from_pairs(pairs))
}

// ── Channels ──────────────────────────────────────────────────────────────────

fn open_channel(cli: &Cli) -> Result<(Arc<ChannelRegistry>, AsyncReqChannel)> {
    if cli.config.channel.transport == TransportKind::Mq {
        bail!("the mq transport runs an in-process broker; use tcp or http from the command line");
    }
    let factory: Arc<dyn TransportFactory> = Arc::new(Transports::new(&cli.config, Arc::new(InMemoryBroker::new())));
    let registry = ChannelRegistry::new(factory);
    let channel = registry
        .obtain(&ChannelOptions::from_config(&cli.config))
        .context("failed to open request channel")?;
    Ok((registry, channel))
}

async fn request(cli: &Cli, mut load: Load) -> Result<Option<Value>> {
    load.entry("id")
        .or_insert_with(|| Value::String(cli.config.identity.node_id.clone()));
    let (_registry, channel) = open_channel(cli)?;
    let reply = channel
        .send(load)
        .await
        .with_context(|| format!("request to {} failed", cli.config.master.req_uri))?;
    channel.close();
    Ok(reply)
}

fn print_value(cli: &Cli, value: &Value) -> Result<()> {
    let text = if cli.pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn cmd_req(cli: &Cli, load: Load) -> Result<()> {
    match request(cli, load).await? {
        Some(reply) => print_value(cli, &reply),
        None => {
            println!("(empty reply)");
            Ok(())
        }
    }
}

async fn cmd_publish(cli: &Cli, words: &[&str]) -> Result<()> {
    let mut load = pairs_to_load(words)?;
    if !load.contains_key("fun") {
        bail!("publish needs fun=<function>");
    }
    load.insert("cmd".into(), Value::String("publish".into()));
    load.entry("tgt").or_insert_with(|| Value::String("*".into()));
    load.entry("tgt_type").or_insert_with(|| Value::String("glob".into()));
    cmd_req(cli, load).await
}

async fn cmd_pillar(cli: &Cli) -> Result<()> {
    if cli.config.channel.crypt != Crypt::Aes {
        bail!("pillar data is only sent over an aes channel");
    }
    let (_registry, channel) = open_channel(cli)?;
    let mut load = pairs_to_load(&["cmd=_pillar"])?;
    load.insert("id".into(), Value::String(cli.config.identity.node_id.clone()));
    let pillar = channel
        .crypted_transfer_decode_dictentry(load, "pillar")
        .await
        .context("pillar request failed")?;
    channel.close();
    print_value(cli, &pillar)
}

async fn cmd_listen(cli: &Cli) -> Result<()> {
    let (registry, channel) = open_channel(cli)?;
    let opts = ChannelOptions::from_config(&cli.config);
    let transport = registry
        .factory()
        .pub_client(&opts)
        .context("failed to build publish transport")?;
    let subscriber = AsyncPubChannel::new(Arc::new(channel), transport);

    let pretty = cli.pretty;
    subscriber.on_recv(Some(Arc::new(move |load: Load| {
        let value = Value::Object(load);
        let text = if pretty {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        };
        match text {
            Ok(text) => println!("{text}"),
            Err(e) => tracing::warn!(error = %e, "unprintable publish"),
        }
    })));
    subscriber
        .connect()
        .await
        .with_context(|| format!("failed to subscribe at {}", cli.config.master.publish_uri))?;
    tracing::info!(node = %cli.config.identity.node_id, "listening for publishes");

    tokio::signal::ctrl_c().await.ok();
    subscriber.close().await;
    Ok(())
}

fn cmd_keys(cli: &Cli, action: &[&str]) -> Result<()> {
    let keys = KeyAuthority::new(
        &cli.config.identity.pki_dir,
        cli.config.auth.clone(),
        cli.config.publish.sign_pub_messages,
    )
    .with_context(|| format!("failed to open pki dir {}", cli.config.identity.pki_dir.display()))?;

    match action {
        [] | ["list"] => {
            for (label, state) in [
                ("Accepted", KeyState::Accepted),
                ("Pending", KeyState::Pending),
                ("Rejected", KeyState::Rejected),
                ("Denied", KeyState::Denied),
            ] {
                println!("{label}:");
                for id in keys.list(state) {
                    println!("  {id}");
                }
            }
        }
        ["accept", id] => {
            if !keys.accept(id)? {
                bail!("no pending key for {id}");
            }
            println!("Accepted {id}.");
        }
        ["reject", id] => {
            if !keys.reject(id)? {
                bail!("no key for {id}");
            }
            println!("Rejected {id}.");
        }
        other => bail!("unknown keys action: {}", other.join(" ")),
    }
    Ok(())
}

fn print_usage() {
    println!("Usage: saltline-ctl [options] <command>");
    println!();
    println!("Commands:");
    println!("  ping                      Ping the master");
    println!("  req key=value...          Send a request load");
    println!("  publish fun=... [tgt=...] Ask the master to publish a job");
    println!("  pillar                    Fetch this node's private pillar data");
    println!("  listen                    Print publishes addressed to this node");
    println!("  keys [list]               List keys known to the local pki dir");
    println!("  keys accept|reject <id>   Move a minion key");
    println!();
    println!("Options:");
    println!("  --config <path>      Config file (default: $SALTLINE_CONFIG or ~/.config/saltline/config.toml)");
    println!("  --id <node>          Node id");
    println!("  --master <host:port> Request endpoint");
    println!("  --publish <host:port> Publish endpoint");
    println!("  --transport <kind>   tcp | http | mq");
    println!("  --crypt <mode>       aes | clear");
    println!("  --pretty             Pretty-print JSON");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut config_path: Option<PathBuf> = None;
    let mut overrides: Vec<(&str, &str)> = Vec::new();
    let mut pretty = false;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            flag @ ("--config" | "--id" | "--master" | "--publish" | "--transport" | "--crypt") => {
                i += 1;
                let value = args
                    .get(i)
                    .with_context(|| format!("{flag} requires a value"))?;
                if flag == "--config" {
                    config_path = Some(PathBuf::from(value));
                } else {
                    overrides.push((flag, value.as_str()));
                }
            }
            "--pretty" => pretty = true,
            other => remaining.push(other),
        }
        i += 1;
    }

    let path = config_path.unwrap_or_else(SaltlineConfig::file_path);
    let mut config = SaltlineConfig::load_from(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    for (flag, value) in overrides {
        match flag {
            "--id" => config.identity.node_id = value.to_string(),
            "--master" => config.master.req_uri = value.to_string(),
            "--publish" => config.master.publish_uri = value.to_string(),
            "--transport" => config.channel.transport = parse_transport(value)?,
            "--crypt" => config.channel.crypt = parse_crypt(value)?,
            _ => {}
        }
    }
    let cli = Cli { config, pretty };

    match remaining.as_slice() {
        ["ping"] | [] => cmd_req(&cli, pairs_to_load(&["cmd=ping"])?).await,
        ["req", words @ ..] if !words.is_empty() => cmd_req(&cli, pairs_to_load(words)?).await,
        ["publish", words @ ..] => cmd_publish(&cli, words).await,
        ["pillar"] => cmd_pillar(&cli).await,
        ["listen"] => cmd_listen(&cli).await,
        ["keys", action @ ..] => cmd_keys(&cli, action),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_keep_json_values_typed() {
        let load = pairs_to_load(&["fun=test.ping", "tgt=[\"web-01\",\"db-01\"]", "n=3"]).unwrap();
        assert_eq!(load["fun"], "test.ping");
        assert_eq!(load["tgt"], serde_json::json!(["web-01", "db-01"]));
        assert_eq!(load["n"], 3);
        assert!(pairs_to_load(&["novalue"]).is_err());
    }

    #[test]
    fn transport_and_crypt_names() {
        assert_eq!(parse_transport("http").unwrap(), TransportKind::Http);
        assert!(parse_transport("zmq").is_err());
        assert_eq!(parse_crypt("clear").unwrap(), Crypt::Clear);
        assert!(parse_crypt("rsa").is_err());
    }
}
