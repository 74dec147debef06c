use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use voicelink::calls::{AlwaysGranted, CallEvent, CallManager, SilenceCapture};
use voicelink::{ClientConfig, SignalingClient, StaticCredentials};
use voicelink_tokio_transport::TokioWebSocketTransportFactory;

// Terminal demo: connect to the signaling server and drive a call by hand.
//
// Usage:
//   cargo run -- --identity a@x.com --token <JWT>
//   cargo run -- -i a@x.com -t <JWT> --server wss://host/api/v1/ws
//
// Then type commands:
//   call <email>   ring a contact
//   accept         answer the ringing call
//   reject         decline the ringing call
//   end            hang up
//   quit

#[derive(Parser)]
struct Args {
    /// Your own email address.
    #[arg(short, long)]
    identity: String,

    /// Bearer token for the signaling server.
    #[arg(short, long, env = "VOICELINK_TOKEN")]
    token: String,

    /// Signaling endpoint override.
    #[arg(short, long)]
    server: Option<String>,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        let mut config = ClientConfig::default();
        if let Some(server) = args.server {
            config.signaling_url = server;
        }

        let credentials = StaticCredentials::logged_in(args.identity, args.token);
        let factory = Arc::new(TokioWebSocketTransportFactory::new());
        let (signaling, signaling_rx) =
            SignalingClient::new(config.clone(), credentials.clone(), factory);

        let manager = CallManager::new(
            &config,
            signaling.clone(),
            credentials,
            Arc::new(AlwaysGranted),
            Arc::new(SilenceCapture),
        );

        let runner = manager.clone();
        tokio::spawn(async move { runner.run(signaling_rx).await });

        let mut call_events = manager.events().subscribe_calls();
        tokio::spawn(async move {
            while let Ok(event) = call_events.recv().await {
                match event.as_ref() {
                    CallEvent::StatusChanged(status) => info!("status: {:?}", status),
                    CallEvent::IncomingCall { peer } => {
                        info!("incoming call from {peer} - type 'accept' or 'reject'")
                    }
                    CallEvent::RemoteAudio(_) => info!("remote audio flowing"),
                    CallEvent::Rejected { peer } => info!("{peer} declined the call"),
                    CallEvent::Ended { peer } => {
                        info!("call ended by {}", peer.as_deref().unwrap_or("peer"))
                    }
                    CallEvent::Failed { reason } => warn!("call failed: {reason}"),
                    CallEvent::ProtocolError { reason } => warn!("protocol error: {reason}"),
                    CallEvent::PermissionDenied => warn!("microphone permission denied"),
                    CallEvent::SignalingUnavailable => warn!("signaling service not connected"),
                }
            }
        });

        let mut connectivity = manager.events().subscribe_connectivity();
        tokio::spawn(async move {
            while let Ok(ready) = connectivity.recv().await {
                info!(
                    "signaling {}",
                    if ready { "connected" } else { "disconnected" }
                );
            }
        });

        signaling.connect();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        info!("Ready. Commands: call <email> | accept | reject | end | quit");
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            let result = match line.split_once(' ') {
                Some(("call", peer)) => manager.start_call(peer.trim()).await,
                None if line == "accept" => manager.accept_call().await,
                None if line == "reject" => manager.reject_call().await,
                None if line == "end" => manager.end_call().await,
                None if line == "quit" => break,
                _ => {
                    warn!("unknown command: {line}");
                    Ok(())
                }
            };
            if let Err(e) = result {
                error!("{e}");
            }
        }

        manager.teardown_call().await;
        signaling.disconnect().await;
    });
}
