//! # FolkMQ CLI
//!
//! Command-line utilities for inspecting topics, urls and client settings.

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use folkmq_client::{
    rewrite_url, ClientSettings, Entity, Frame, MemoryConnector, MqClient, MqMessage, Outbound,
};
use folkmq_proto::{bare_topic, full_topic, metas, queue_name, MqEvent, VERSION_CODE, VERSION_NAME};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "full-topic" => {
            let (namespace, topic) = match args.len() {
                3 => ("", &args[2]),
                4 => (args[2].as_str(), &args[3]),
                _ => usage("folkmq full-topic [namespace] <topic>"),
            };
            println!("{}", full_topic(namespace, topic));
        }
        "bare-topic" => {
            if args.len() < 3 {
                usage("folkmq bare-topic <full-topic>");
            }
            println!("{}", bare_topic(&args[2]));
        }
        "queue-name" => {
            if args.len() < 4 {
                usage("folkmq queue-name <full-topic> <consumer-group>");
            }
            println!("{}", queue_name(&args[2], &args[3]));
        }
        "rewrite-url" => {
            if args.len() < 3 {
                usage("folkmq rewrite-url <url>");
            }
            let url = rewrite_url(&args[2]).context("Failed to rewrite url")?;
            println!("{url}");
        }
        "settings" => {
            let settings = ClientSettings::from_env().context("Invalid FOLKMQ_* environment")?;
            print_settings(&settings);
        }
        "loopback" => {
            let settings = ClientSettings::from_env().context("Invalid FOLKMQ_* environment")?;
            loopback(&settings).await?;
        }
        "version" => {
            println!("folkmq {VERSION_NAME} (protocol {VERSION_CODE})");
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn usage(text: &str) -> ! {
    eprintln!("Usage: {text}");
    std::process::exit(1);
}

fn print_settings(settings: &ClientSettings) {
    println!("server_urls:       {}", settings.server_urls.join(","));
    println!("name:              {}", settings.name.as_deref().unwrap_or("-"));
    println!("namespace:         {}", settings.namespace.as_deref().unwrap_or("-"));
    println!("request_timeout:   {:?}", settings.request_timeout);
    println!("subscribe_timeout: {:?}", settings.subscribe_timeout);
    println!("heartbeat:         {:?}", settings.heartbeat_interval);
    println!("auto_ack:          {}", settings.auto_ack);
}

/// Subscribe, publish and deliver one message through the in-memory
/// transport, printing the traffic each step produces.
async fn loopback(settings: &ClientSettings) -> Result<()> {
    tracing::info!(name = ?settings.name, namespace = ?settings.namespace, "Running loopback");

    let connector = Arc::new(MemoryConnector::new(1));
    let client = MqClient::from_settings(connector.clone(), settings);
    if client.name().is_none() {
        client.set_name("folkmq-cli");
    }

    client
        .subscribe("loopback", None, None, |message| {
            println!(
                "received: topic={} key={} body={}",
                message.topic(),
                message.key(),
                message.body_as_string()
            );
            Ok(())
        })
        .await
        .context("Failed to subscribe")?;

    client.connect().await.context("Failed to connect")?;
    let Some(group) = connector.last_group() else {
        bail!("connector opened no session group");
    };

    let message = MqMessage::new("hello from folkmq").key("loopback-1");
    let qualified = full_topic(client.namespace().as_deref().unwrap_or(""), "loopback");
    let delivery = message.to_publish_entity(&qualified);
    client
        .publish("loopback", message)
        .await
        .context("Failed to publish")?;

    let consumer_group = client.name().unwrap_or_default();
    group.deliver(
        0,
        Frame::new(
            "loopback-sid",
            MqEvent::Distribute,
            delivery.meta_put(metas::CONSUMER_GROUP, consumer_group),
        ),
    );

    for outbound in group.session(0).take_outbound() {
        print_outbound(&outbound);
    }

    client.disconnect().await;
    Ok(())
}

fn print_outbound(outbound: &Outbound) {
    match outbound {
        Outbound::Send { event, entity } => println!("send     {event} {}", describe(entity)),
        Outbound::Request { event, entity } => println!("request  {event} {}", describe(entity)),
        Outbound::Ack { sid, entity } => println!("ack      {sid} {}", describe(entity)),
        Outbound::Alarm { sid, text } => println!("alarm    {sid} {text}"),
    }
}

fn describe(entity: &Entity) -> String {
    let pairs = entity
        .metas()
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!("[{pairs}] {}", entity.data_as_string())
}

fn print_help() {
    println!(
        r#"FolkMQ CLI

USAGE:
    folkmq <COMMAND> [OPTIONS]

COMMANDS:
    full-topic [ns] <topic>        Qualify a topic with a namespace
    bare-topic <full-topic>        Strip the namespace from a topic
    queue-name <topic> <group>     Queue name of a subscription
    rewrite-url <url>              Show the transport url of a folkmq url
    settings                       Print settings loaded from FOLKMQ_* variables
    loopback                       Run a subscribe/publish/deliver round trip in memory
    version                        Show client and protocol versions
    help                           Show this help message

EXAMPLES:
    folkmq full-topic prod orders
    folkmq rewrite-url folkmq:ws://127.0.0.1:18602/ws
    FOLKMQ_NAME=billing folkmq loopback
"#
    );
}
