//! srt-session echo example.
//!
//! Environment variables:
//! - SRT_MODE: "server" or "client" (default server)
//! - SRT_HOST: bind host (server) or server host (client), default 127.0.0.1
//! - SRT_PORT: port, default 9000
//! - SRT_STREAM_ID: stream id sent by the client, e.g. `#!::r=live/cam1,m=publish`

use std::env;
use std::io::{self, BufRead};
use std::process::ExitCode;

use srt_session::server::Server;
use srt_session::{Context, SrtResult, StatsSnapshot};

fn main() -> ExitCode {
    let mode = env::var("SRT_MODE").unwrap_or_else(|_| "server".to_string());
    let host = env::var("SRT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = env::var("SRT_PORT").unwrap_or_else(|_| "9000".to_string());

    let result = match mode.as_str() {
        "server" => run_server(&host, &port),
        "client" => run_client(&host, &port, env::var("SRT_STREAM_ID").ok()),
        other => {
            eprintln!("unknown SRT_MODE {other:?}, expected server or client");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("srt-echo: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_server(host: &str, port: &str) -> SrtResult<()> {
    let context = Context::new()?;
    let server = Server::bind(&context, host, port)?;
    eprintln!("Echo server listening on {}", server.local_addr()?);

    server.start(|connection| {
        let peer = connection.peer_addr().ok();
        let resource = connection
            .stream_id()
            .map(|components| components.resource_name)
            .unwrap_or_default();
        eprintln!("Client connected from {peer:?} (resource {resource:?})");

        connection.on_data(|socket, data| {
            if let Err(e) = socket.send_message(data) {
                eprintln!("Echo to {} failed: {e}", socket.id());
            }
        });
        connection.on_close(move |socket| {
            eprintln!("Client {} ({peer:?}) disconnected", socket.id());
        });
        true
    })
}

fn run_client(host: &str, port: &str, stream_id: Option<String>) -> SrtResult<()> {
    let context = Context::new()?;
    let socket = context.socket()?;
    if let Some(stream_id) = stream_id {
        socket.set_stream_id(&stream_id)?;
    }
    socket.connect(host, port)?;
    eprintln!("Connected to {}; enter messages to echo (Ctrl+D to exit)", socket.peer_addr()?);

    for line in io::stdin().lock().lines() {
        let text = line?;
        socket.send_message(text.as_bytes())?;
        match socket.receive_message()? {
            Some(echoed) if echoed == text.as_bytes() => eprintln!("Echo matched: {text:?}"),
            Some(echoed) => eprintln!(
                "Echo mismatch: expected {text:?}, got {:?}",
                String::from_utf8_lossy(&echoed)
            ),
            None => {
                eprintln!("Server closed the connection");
                break;
            }
        }
    }

    let stats = StatsSnapshot::capture(&socket, false)?;
    eprintln!(
        "Sent {} packets ({} bytes), retransmitted {}, RTT {:.1} ms",
        stats.pkt_sent_total, stats.byte_sent_total, stats.pkt_retrans_total, stats.ms_rtt
    );
    socket.close()
}
