use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chatcall::calls::{
    CallManager, CallManagerConfig, CallObserver, LoggingObserver, LoopbackEngineFactory,
    MemoryRelayHub,
};
use chatcall::{CallId, CallState, MediaKind, ParticipantId, StateCause};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use log::info;
use tokio::sync::mpsc;

// Two endpoints, "alice" and "bob", talking over an in-memory relay with
// loopback negotiation engines. Alice calls Bob and the scenario decides what
// happens next.
//
// Usage:
//   cargo run                                   # Bob accepts, Alice hangs up
//   cargo run -- reject                         # Bob declines
//   cargo run -- no-answer --ring-timeout-secs 3
//   cargo run -- drop --video                   # Alice loses the relay mid-call

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    Accept,
    Reject,
    NoAnswer,
    Drop,
}

#[derive(Debug, Parser)]
#[command(about = "Run a two-party call over an in-memory relay")]
struct Args {
    #[arg(value_enum, default_value_t = Scenario::Accept)]
    scenario: Scenario,

    /// Place a video call instead of audio only.
    #[arg(long)]
    video: bool,

    #[arg(long, default_value_t = 60)]
    ring_timeout_secs: u64,

    /// Local candidates each engine gathers.
    #[arg(long, default_value_t = 2)]
    candidates: usize,
}

/// Tells the demo when Bob's phone starts ringing.
struct RingNotifier {
    incoming: mpsc::UnboundedSender<CallId>,
}

#[async_trait]
impl CallObserver for RingNotifier {
    async fn on_state_changed(&self, call_id: &CallId, state: CallState, cause: &StateCause) {
        info!("[bob] call {} is now {} ({:?})", call_id, state, cause);
        if state == CallState::Ringing && *cause == StateCause::Created {
            let _ = self.incoming.send(call_id.clone());
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let hub = MemoryRelayHub::new();
    let engines = LoopbackEngineFactory::new().with_local_candidates(args.candidates);
    let config = CallManagerConfig::default()
        .with_ring_timeout(Duration::from_secs(args.ring_timeout_secs));

    let alice_id = ParticipantId::new("alice");
    let bob_id = ParticipantId::new("bob");
    let (alice_relay, alice_events) = hub.connect(alice_id.clone());
    let (bob_relay, bob_events) = hub.connect(bob_id.clone());
    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();

    let alice = CallManager::new(
        Arc::new(alice_relay),
        Arc::new(engines.clone()),
        Arc::new(LoggingObserver),
        config.clone(),
    );
    let bob = CallManager::new(
        Arc::new(bob_relay),
        Arc::new(engines.clone()),
        Arc::new(RingNotifier {
            incoming: incoming_tx,
        }),
        config,
    );
    tokio::spawn(Arc::clone(&alice).run(alice_events));
    tokio::spawn(Arc::clone(&bob).run(bob_events));

    let media_kind = if args.video {
        MediaKind::Video
    } else {
        MediaKind::Audio
    };
    let call = alice.start_call(bob_id.clone(), media_kind, None).await?;
    let incoming = incoming_rx
        .recv()
        .await
        .context("Bob's endpoint never rang")?;

    match args.scenario {
        Scenario::Accept => {
            bob.accept(&incoming).await?;
            call.wait_until(|s| s.state.is_connected() || s.state.is_terminal())
                .await;
            // Give the offer, answer and candidates time to cross the relay.
            tokio::time::sleep(Duration::from_millis(200)).await;
            call.hang_up().await?;
        }
        Scenario::Reject => bob.reject(&incoming).await?,
        Scenario::NoAnswer => {
            info!(
                "Letting the call ring for {}s without answering",
                args.ring_timeout_secs
            );
        }
        Scenario::Drop => {
            bob.accept(&incoming).await?;
            call.wait_until(|s| s.state.is_connected() || s.state.is_terminal())
                .await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            hub.disconnect(&alice_id);
        }
    }

    let ended = call.wait_for_end().await;
    if let Some(remaining) = bob.session(&incoming) {
        // Bob never hears about Alice's lost connection; hang up on his side too.
        let _ = remaining.hang_up().await;
    }

    println!("{}", serde_json::to_string_pretty(&ended)?);
    info!(
        "Engine calls on Alice's side: {:?}",
        engines.calls(&ended.call_id)
    );
    if let Some(secs) = ended.duration_secs() {
        info!("Call lasted {}s", secs);
    }
    Ok(())
}
