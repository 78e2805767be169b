//! Command-line client for the pmud D-Bus endpoint.

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;

#[zbus::proxy(
    interface = "nz.oturu.PmuController1",
    default_service = "nz.oturu.PmuController",
    default_path = "/nz/oturu/PmuController"
)]
trait PmuController {
    async fn is_present(&self) -> zbus::Result<bool>;
    async fn stay_on_for(&self, minutes: u32) -> zbus::Result<()>;
    async fn read_battery_pin(&self) -> zbus::Result<u16>;
    async fn on_battery(&self) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show whether the PMU is present and the power source
    Status,
    /// Delay the scheduled power-off
    StayOn {
        /// Minutes to stay on for
        #[arg(short, long, default_value_t = 60)]
        minutes: u32,
    },
    /// Read the raw battery sense value
    Battery,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let conn = zbus::Connection::system().await?;
    let proxy = PmuControllerProxy::new(&conn).await?;

    match cli.command {
        Commands::Status => {
            if !proxy.is_present().await? {
                println!("PMU not present");
                return Ok(());
            }
            println!("PMU present");
            match proxy.on_battery().await {
                Ok(true) => println!("on battery power"),
                Ok(false) => println!("on mains power"),
                Err(err) => println!("power source unknown: {err}"),
            }
        }
        Commands::StayOn { minutes } => {
            proxy.stay_on_for(minutes).await?;
            println!("staying on for {minutes} minutes");
        }
        Commands::Battery => {
            println!("{}", proxy.read_battery_pin().await?);
        }
    }

    Ok(())
}
