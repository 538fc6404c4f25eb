//! A captive portal with three WebSocket pages.
//!
//! - `/` and `/index`: type a message, the server answers it reversed.
//! - `/status`: the server pushes its uptime every second.
//! - `/mouse`: the browser streams pointer coordinates, the server logs them.
//!
//! Run it on an access point (ports 80 and 53 usually need privileges):
//!
//! ```sh
//! cargo run --example captive_portal -- --http 0.0.0.0:80 --dns 0.0.0.0:53 --ip 192.168.4.1
//! ```
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use clap::Parser;
use wsportal::{
    frame::Frame,
    router::{Response, Router},
    server::{PortalConfig, Server},
    Handlers, Options,
};

#[derive(Parser, Debug)]
#[command(about = "Captive portal with WebSocket demo pages")]
struct Args {
    /// HTTP listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    http: SocketAddr,

    /// DNS listen address
    #[arg(long, default_value = "0.0.0.0:5353")]
    dns: SocketAddr,

    /// Address every DNS name resolves to
    #[arg(long, default_value = "192.168.4.1")]
    ip: Ipv4Addr,

    /// Host name captive-portal probes are redirected to
    #[arg(long, default_value = "examples.local")]
    site: String,
}

const INDEX_BODY: &str = r#"<!DOCTYPE html>
<html><head><title>Echo</title></head>
<body>
<h1>Reverse echo</h1>
<input id="msg" placeholder="message"><button onclick="send()">Send</button>
<pre id="log"></pre>
<script>
const ws = new WebSocket("ws://" + location.host + "/");
const log = (line) => document.getElementById("log").textContent += line + "\n";
ws.onmessage = (ev) => log(ev.data);
function send() { ws.send(document.getElementById("msg").value); }
</script>
</body></html>"#;

const STATUS_BODY: &str = r#"<!DOCTYPE html>
<html><head><title>Status</title></head>
<body>
<h1>Uptime</h1>
<p id="uptime">waiting...</p>
<script>
const ws = new WebSocket("ws://" + location.host + "/status");
ws.onmessage = (ev) => {
  if (ev.data.startsWith("status:")) {
    document.getElementById("uptime").textContent = ev.data.slice(7);
  }
};
</script>
</body></html>"#;

const MOUSE_BODY: &str = r#"<!DOCTYPE html>
<html><head><title>Mouse</title></head>
<body style="height:100vh">
<h1>Move the pointer</h1>
<script>
const ws = new WebSocket("ws://" + location.host + "/mouse");
document.onmousemove = (ev) => {
  if (ws.readyState === WebSocket.OPEN) ws.send(ev.clientX + "," + ev.clientY);
};
</script>
</body></html>"#;

fn reversed(text: &[u8]) -> Vec<u8> {
    String::from_utf8_lossy(text).chars().rev().collect::<String>().into_bytes()
}

fn uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "status:{:02}:{:02}:{:02}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Debug)?;
    let args = Args::parse();

    let router = Router::new()
        .route("/", |_| Response::html(INDEX_BODY))
        .route("/index", |_| Response::html(INDEX_BODY))
        .route("/status", |_| Response::html(STATUS_BODY))
        .route("/mouse", |_| Response::html(MOUSE_BODY));

    let handlers = Handlers::new()
        .on_upgrade(|out, _| {
            log::info!("client connected from {:?}", out.peer_addr());
            out.send_text("[INFO] connected to the server");
        })
        .on_text(|out, text| {
            if out.route() == Some("/mouse") {
                log::info!("mouse (x,y) = ({})", String::from_utf8_lossy(text));
                out.send_text(text.to_vec());
            } else {
                out.send_text(reversed(text));
            }
        })
        .on_ping(|out, _| log::info!("ping from {:?}, pong sent", out.peer_addr()))
        .on_pong(|out, _| log::info!("pong from {:?}", out.peer_addr()))
        .on_close(|out, _| log::info!("client {:?} disconnected", out.peer_addr()));

    let config = PortalConfig::default()
        .with_http_addr(args.http)
        .with_dns_addr(args.dns)
        .with_portal_ip(args.ip)
        .with_site(args.site);

    let handle = Server::new(config, router)
        .with_options(Options::default().with_utf8())
        .with_handlers(handlers)
        .start()
        .await?;

    log::info!("portal running on http://{}", handle.local_addr());

    let ticker = handle.clone();
    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        let started = Instant::now();
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if ticker.broadcast("/status", Frame::text(uptime(started.elapsed()))).is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;

    Ok(())
}
