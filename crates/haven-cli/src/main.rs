use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use clap::Parser;
use haven_core::loopback::{LoopbackHub, SyntheticDevices};
use haven_core::store::FREE_TRIAL_KEY;
use haven_core::{
    CallCoordinator, CallStatus, EventEmitter, HavenEvent, JsonFileStore, KeyValueStore, Paise,
    RetryQueue, SessionMeter, Settings, SettingsStore, Wallet,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

mod cli_args;

use cli_args::{Command, DemoCall, Meter, Opt, TopUp};

/// Everything a subcommand needs, opened from the data directory.
struct Context {
    settings: Settings,
    store: Arc<JsonFileStore>,
    retry: Arc<RetryQueue>,
    emitter: EventEmitter,
    wallet: Arc<Wallet>,
}

impl Context {
    fn open(data_dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        info!("using data directory {}", data_dir.display());
        let settings = SettingsStore::new(&data_dir).get();
        settings.validate()?;
        let store = Arc::new(JsonFileStore::new(&data_dir));
        let retry = Arc::new(RetryQueue::new());
        let emitter = EventEmitter::new();
        emitter.add_listener(Arc::new(log_event));
        let wallet = Arc::new(Wallet::open(store.clone(), retry.clone(), emitter.clone()));
        Ok(Self {
            settings,
            store,
            retry,
            emitter,
            wallet,
        })
    }

    fn meter(&self, feature: haven_core::MeteredFeature, unit_cost: Paise) -> SessionMeter {
        SessionMeter::new(
            feature,
            unit_cost,
            self.wallet.clone(),
            self.store.clone(),
            self.retry.clone(),
            self.emitter.clone(),
        )
    }
}

fn log_event(event: HavenEvent) {
    match event {
        HavenEvent::PersistenceWarning { key, error } => warn!("could not save {key}: {error}"),
        HavenEvent::WalletBalanceChanged(balance) => info!("wallet balance {balance}"),
        other => tracing::debug!("{other:?}"),
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new("haven_core=debug,haven=info")
                }),
        )
        .init();
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    dirs::data_dir()
        .map(|d| d.join("haven"))
        .ok_or_else(|| anyhow!("no data directory on this platform, pass --data-dir"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let opt = Opt::parse();
    let data_dir = match opt.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    match opt.command {
        Command::Balance => balance(Context::open(data_dir)?),
        Command::TopUp(t) => top_up(Context::open(data_dir)?, t),
        Command::Meter(m) => meter(Context::open(data_dir)?, m).await,
        Command::DemoCall(d) => demo_call(Context::open(data_dir)?, d).await,
        Command::Settings => {
            let settings = SettingsStore::new(&data_dir).get();
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn balance(ctx: Context) -> anyhow::Result<()> {
    println!("balance: {}", ctx.wallet.balance());
    match ctx.store.get(FREE_TRIAL_KEY) {
        Some(seconds) => println!("free trial: {seconds}s left"),
        None => println!("free trial: {}s not yet started", ctx.settings.free_trial_seconds),
    }
    Ok(())
}

fn top_up(ctx: Context, args: TopUp) -> anyhow::Result<()> {
    let balance = ctx.wallet.top_up(Paise::from_rupees(args.rupees))?;
    if ctx.retry.pending() > 0 {
        warn!("balance updated in memory only; the data directory is not writable");
    }
    println!("balance: {balance}");
    Ok(())
}

async fn meter(ctx: Context, args: Meter) -> anyhow::Result<()> {
    let tick_interval = args.tick_interval.unwrap_or(ctx.settings.tick_interval_seconds);
    let unit_cost = args.unit_cost.map(Paise).unwrap_or_else(|| ctx.settings.unit_cost());
    let meter = ctx.meter(args.feature.into(), unit_cost);
    meter.start(ctx.settings.free_trial_seconds, tick_interval)?;

    let mut snapshots = meter.subscribe();
    let deadline = tokio::time::sleep(Duration::from_secs(args.seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if snapshot.insufficient_funds {
                    println!("insufficient funds, top up to continue");
                    break;
                }
            }
        }
    }
    meter.stop();

    let snapshot = meter.snapshot();
    println!(
        "{}: {}s free left, balance {}",
        snapshot.feature.label(),
        snapshot.free_seconds_remaining,
        ctx.wallet.balance()
    );
    Ok(())
}

/// The local identity for a demo call: `--caller`, else the display name.
fn caller_identity(args: &DemoCall, settings: &Settings) -> String {
    args.caller
        .clone()
        .or_else(|| settings.display_name.clone())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "user1".to_string())
}

async fn demo_call(ctx: Context, args: DemoCall) -> anyhow::Result<()> {
    let caller_id = caller_identity(&args, &ctx.settings);
    if caller_id == args.callee {
        return Err(anyhow!("caller and callee must differ, both are {caller_id}"));
    }
    let hub = Arc::new(LoopbackHub::new());
    let caller_devices = Arc::new(SyntheticDevices::new());
    let callee_devices = Arc::new(SyntheticDevices::new());
    let caller = Arc::new(CallCoordinator::new(
        hub.clone(),
        caller_devices,
        ctx.emitter.clone(),
        ctx.settings.call_config(),
    ));
    let callee = CallCoordinator::new(
        hub.clone(),
        callee_devices.clone(),
        EventEmitter::new(),
        ctx.settings.call_config(),
    );

    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();
    callee.on_incoming_session(move |session| {
        let _ = incoming_tx.send(session);
    });

    let video = ctx.settings.camera_enabled_on_join;
    let audio = ctx.settings.mic_enabled_on_join || !video;
    caller.initialize(&caller_id).await?;
    callee.initialize(&args.callee).await?;
    caller.acquire_local_media(video, audio).await?;
    callee.acquire_local_media(video, audio).await?;
    println!("{}: {}", caller_id, caller.status_text().await);

    let dialing = {
        let caller = caller.clone();
        let callee_id = args.callee.clone();
        tokio::spawn(async move { caller.call(&callee_id).await })
    };
    let incoming = incoming_rx
        .recv()
        .await
        .ok_or_else(|| anyhow!("{} never rang", args.callee))?;
    println!("{}: {} from {}", args.callee, callee.status_text().await, incoming.remote_identity);
    callee.answer(&incoming.id).await?;
    dialing.await??;
    println!("{}: {}", caller_id, caller.status_text().await);

    let meter = ctx.meter(haven_core::MeteredFeature::VideoCall, ctx.settings.unit_cost());
    meter.start(ctx.settings.free_trial_seconds, ctx.settings.tick_interval_seconds)?;

    if video {
        let facing = caller.switch_camera().await?;
        println!("{}: camera now {facing:?}", caller_id);
        callee.start_screen_share().await?;
        println!("{}: sharing screen", args.callee);
        callee_devices.revoke_screen_share();
    }

    tokio::time::sleep(Duration::from_secs(args.hold)).await;
    meter.stop();
    caller.end().await?;

    for _ in 0..50 {
        if callee.status().await == CallStatus::Ended {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("{}: {}", args.callee, callee.status_text().await);

    caller.destroy().await;
    callee.destroy().await;
    println!("balance: {}", ctx.wallet.balance());
    Ok(())
}
