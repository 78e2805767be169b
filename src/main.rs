use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pmu_controller::api::{ApiClient, HttpProbe};
use pmu_controller::device::{DeviceLink, I2cRegisterBus, PowerController};
use pmu_controller::heartbeat::{self, SystemClock};
use pmu_controller::{config, service, stats, Config, StayOnOverride, Voltages};

/// How long to wait before the first on-window check. This gives time
/// to do something with the device before it turns off.
const INITIAL_GRACE_PERIOD: Duration = Duration::from_secs(20 * 60);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);
const WINDOW_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_FILE)]
    config: String,

    /// Apply the on window right away instead of waiting out the boot
    /// grace period
    #[arg(short, long)]
    skip_wait: bool,

    /// Don't shut down the operating system when powering down
    #[arg(long)]
    skip_system_shutdown: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with pretty colors
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("pmu_controller=info,pmud=info")),
        )
        .compact()
        .init();

    // Initialize color-eyre for pretty error reporting
    color_eyre::install()?;

    run(Args::parse()).await
}

async fn run(args: Args) -> Result<()> {
    let stay_on = Arc::new(StayOnOverride::new(Local::now()));

    let conf = match Config::load(&args.config) {
        Ok(conf) => conf,
        Err(err) => {
            warn!("error parsing config: {err}; will try to just ping the watchdog");
            return watchdog_only().await;
        }
    };

    info!("connecting to PMU");
    let bus = I2cRegisterBus::open()?;
    let Some(link) = DeviceLink::connect(Box::new(bus)).await? else {
        info!("PMU not present");
        // Keep answering is_present queries so callers can tell the
        // difference between "no PMU" and "daemon dead".
        let _conn = service::start(None, stay_on).await?;
        std::future::pending::<()>().await;
        return Ok(());
    };
    info!("connected to PMU");

    let controller = Arc::new(PowerController::new(
        Arc::new(link),
        conf.voltages,
        conf.wifi_interface.clone(),
    ));

    match controller.is_on_battery().await {
        Ok(true) => info!("on battery power"),
        Ok(false) => info!("not on battery"),
        Err(err) => warn!("{err}"),
    }

    info!("starting D-Bus service");
    let _conn = service::start(Some(controller.clone()), stay_on.clone()).await?;

    tokio::spawn(watchdog_loop(controller.clone()));

    if let Err(err) = controller.sync_wifi_link_state().await {
        warn!("failed to update wifi state: {err}");
    }

    if conf.voltages.enable {
        tokio::spawn(stats::battery_log_loop(controller.clone()));
    }

    info!("on window: {}", conf.on_window);

    if let Some(api) = conf.api.clone() {
        let window = conf.on_window;
        tokio::spawn(async move {
            let mut probe = HttpProbe::new(api.url.clone());
            let mut client = ApiClient::new(api.url, api.token);
            heartbeat::run(&window, &SystemClock, &mut probe, &mut client).await;
        });
    } else {
        info!("no heartbeat API configured, not reporting liveness");
    }

    if !conf.on_window.has_window() {
        info!("no window configured so pinging watchdog only");
        std::future::pending::<()>().await;
    }

    if !args.skip_wait {
        info!("waiting {INITIAL_GRACE_PERIOD:?} before applying the on window");
        time::sleep(INITIAL_GRACE_PERIOD).await;
    }

    loop {
        let now = Local::now();
        if conf.on_window.is_active(now.time()) {
            let until_end = conf.on_window.until_end(now.time());
            info!("{until_end:?} until the on window ends, sleeping");
            time::sleep(until_end).await;
        } else {
            let minutes_until_active =
                (conf.on_window.until_start(now.time()).as_secs() / 60) as i64;
            info!("minutes until active: {minutes_until_active}");
            if stay_on.should_power_off(minutes_until_active, now) {
                info!("syncing filesystems...");
                sync_filesystems().await;

                info!("requesting power off...");
                controller
                    .request_power_off(minutes_until_active - 2)
                    .await?;
                info!("power off requested");

                if !args.skip_system_shutdown {
                    info!("shutting down system...");
                    shutdown().await?;
                }
            }
            time::sleep(WINDOW_CHECK_INTERVAL).await;
        }
    }
}

/// Fallback for a broken config: the watchdog still has to be fed or
/// the PMU will power-cycle the host.
async fn watchdog_only() -> Result<()> {
    let bus = I2cRegisterBus::open()?;
    let Some(link) = DeviceLink::connect(Box::new(bus)).await? else {
        info!("PMU not present");
        return Ok(());
    };
    info!("connected to PMU");
    let controller = Arc::new(PowerController::new(
        Arc::new(link),
        Voltages::default(),
        String::new(),
    ));
    watchdog_loop(controller).await;
    Ok(())
}

async fn watchdog_loop(controller: Arc<PowerController>) {
    info!("sending watchdog timer updates");
    loop {
        if let Err(err) = controller.ping_watchdog().await {
            // An unserviced watchdog means an uncommanded power cycle
            // is coming; die loudly instead.
            error!("watchdog ping failed: {err}");
            std::process::exit(1);
        }
        time::sleep(WATCHDOG_INTERVAL).await;
    }
}

async fn sync_filesystems() {
    if let Err(err) = tokio::process::Command::new("sync").status().await {
        warn!("sync failed: {err}");
    }
}

async fn shutdown() -> Result<()> {
    let output = tokio::process::Command::new("/sbin/poweroff")
        .output()
        .await?;
    if !output.status.success() {
        return Err(eyre!(
            "poweroff failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(())
}
