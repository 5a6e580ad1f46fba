//! Object link walkthrough
//!
//! Runs a link server hosting two object types (a relay bank and a touch
//! panel) and a client that proxies them, in one process:
//!
//! - the client creates proxies by alias and declared type
//! - property reads travel as queries and block on their ticket
//! - method calls travel as commands or queries
//! - hardware events (here a simulated button press) come back as
//!   unsolicited updates
//!
//! Usage:
//!   cargo run -p relay-panel
//!   cargo run -p relay-panel -- --port 42700 --secret hunter2

use clap::Parser;
use objlink::{
    LinkConfig, LinkEngine, LinkServer, NodeEvent, Result, ServerConfig, UpdateSink,
};
use parking_lot::Mutex;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(about = "Object link relay/panel walkthrough")]
struct Args {
    /// Listening port (0 picks an ephemeral port)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Shared secret for the link
    #[arg(long, default_value = "demo-secret")]
    secret: String,
}

/// Simulated relay bank: four relays, one State property per relay
/// disambiguated by qualifier on updates.
fn register_relay_bank(server: &LinkServer) {
    server.factory().register("RelayInterface", |ctx| {
        let closed = Arc::new(Mutex::new(false));
        let read_closed = Arc::clone(&closed);
        let toggle_closed = Arc::clone(&closed);
        let events = ctx.events.clone();

        Ok(ctx
            .builder()
            .read("State", move || {
                Ok(json!(if *read_closed.lock() { "Closed" } else { "Open" }))
            })
            .method("Toggle", move |_args| {
                let closed = Arc::clone(&toggle_closed);
                let events = events.clone();
                async move {
                    let state = {
                        let mut c = closed.lock();
                        *c = !*c;
                        if *c { "Closed" } else { "Open" }
                    };
                    events.update("State", json!(state));
                    Ok(json!(state))
                }
            })
            .build())
    });
}

/// Simulated touch panel: a text label and a button whose presses arrive
/// as hardware events.
fn register_touch_panel(server: &LinkServer) {
    server.factory().register("TouchPanel", |ctx| {
        let label = Arc::new(Mutex::new(String::from("Lobby")));
        let read_label = Arc::clone(&label);
        let write_label = Arc::clone(&label);

        Ok(ctx
            .builder()
            .read_write(
                "Label",
                move || Ok(json!(*read_label.lock())),
                move |value| {
                    *write_label.lock() = value.as_str().unwrap_or_default().to_owned();
                    Ok(())
                },
            )
            .build())
    });
}

/// Pretend a finger hits button 3 on the panel.
fn simulate_button_press(sink: &UpdateSink) {
    sink.update_with("ButtonPressed", json!(true), Some(json!(3)));
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let listen: SocketAddr = ([127, 0, 0, 1], args.port).into();
    let server = Arc::new(LinkServer::new(
        ServerConfig::new(args.secret.clone()).listen_on(vec![listen]),
    ));
    register_relay_bank(&server);
    register_touch_panel(&server);

    let addrs = server.start().await?;
    let addr = addrs[0];
    info!(%addr, "server side up");

    let client = LinkEngine::connect(
        LinkConfig::new(addr, args.secret.clone())
            .protocol_version("1.0")
            .keepalive_interval(Duration::from_secs(5)),
    );
    client.wait_connected().await;
    info!("link established");

    // Create the stand-ins. The server builds the real objects on first
    // init and acks.
    let relay = client.create_node("Relay1", "RelayInterface", vec![]).await?;
    let panel = client.create_node("Panel1", "TouchPanel", vec![]).await?;

    // Property read: a blocking query under the covers.
    let state = relay.get("State").await?;
    info!(%state, "relay state");

    // Method call that also fires a hardware event back at us.
    let mut events = relay.subscribe();
    let state = relay.call("Toggle", vec![]).await?;
    info!(%state, "relay toggled");
    if let Ok(NodeEvent::Update {
        property, value, ..
    }) = events.recv().await
    {
        info!(property, %value, "unsolicited update");
    }

    // Property write: a fire-and-forget command.
    panel.set("Label", json!("Conference A")).await?;
    let label = panel.get("Label").await?;
    info!(%label, "panel label");

    // Hardware-side event with a qualifier naming the button.
    let mut presses = panel.subscribe();
    simulate_button_press(&server.update_sink("Panel1"));
    if let Ok(NodeEvent::Update {
        property,
        qualifier,
        ..
    }) = presses.recv().await
    {
        info!(property, ?qualifier, "panel event");
    }

    client.shutdown();
    info!("done");
    Ok(())
}
