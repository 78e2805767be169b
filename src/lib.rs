/*!
 # PMU Controller Library

 A Rust library for supervising a battery-powered single-board computer
 through a companion power-management microcontroller (PMU) attached to the
 I2C bus. The PMU owns the power rail: it carries a watchdog that
 power-cycles the host when left unserviced and a sleep timer that cuts
 power for a requested number of minutes.

 ## Features

 * Presence detection and protocol-version discovery for the PMU
 * Serialized, retried register reads/writes over the shared bus
 * Watchdog servicing and scheduled power-off requests
 * Battery voltage sampling with rejection of invalid analog reads
 * Recurring daily on-window arithmetic (with midnight wraparound)
 * Liveness heartbeat scheduling against a remote service

 ## Example

 ```no_run
 use pmu_controller::*;
 use pmu_controller::device::I2cRegisterBus;

 #[tokio::main]
 async fn main() -> Result<()> {
     // Initialize tracing for logs
     tracing_subscriber::fmt::init();

     let bus = I2cRegisterBus::open()?;
     let Some(link) = device::DeviceLink::connect(Box::new(bus)).await? else {
         eprintln!("PMU not present");
         return Ok(());
     };

     let controller = device::PowerController::new(
         link.into(),
         config::Voltages::default(),
         "wlan0".to_string(),
     );
     controller.ping_watchdog().await?;
     Ok(())
 }
 ```
*/

use thiserror::Error;

/// Custom error types for the PMU controller library
#[derive(Error, Debug)]
pub enum Error {
    /// Bus transaction failed (after retries where applicable)
    #[error("bus transaction error: {0}")]
    Bus(String),

    /// No PMU answered the presence probe
    #[error("PMU not present on the bus")]
    NotPresent,

    /// Operation requires a newer PMU firmware than was detected
    #[error("PMU version is {have} and needs version {need} or above for '{op}'")]
    UnsupportedVersion {
        op: &'static str,
        have: u8,
        need: u8,
    },

    /// Battery sampling kept returning the invalid-read sentinel
    #[error("no clean battery sample after {0} attempts")]
    BatterySample(u32),

    /// Stay-on request past the permitted maximum
    #[error("can not delay power off for over {0} hours")]
    StayOnTooLong(u64),

    /// Malformed configuration
    #[error("invalid config: {0}")]
    Config(String),

    /// Heartbeat service reported a failure
    #[error("heartbeat API error: {0}")]
    Api(String),

    /// No network connectivity could be established
    #[error("unable to establish a network connection")]
    NoConnectivity,

    /// External command failed
    #[error("command '{cmd}' failed: {detail}")]
    Command { cmd: String, detail: String },

    /// Error from the I2C subsystem
    #[error(transparent)]
    I2c(#[from] rppal::i2c::Error),

    /// Error from the D-Bus connection
    #[error(transparent)]
    Dbus(#[from] zbus::Error),

    /// Error from the HTTP client
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// YAML parse error
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Other I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// Import needed for Result type extension
pub type Result<T> = std::result::Result<T, Error>;

// Re-export modules
pub mod api;
pub mod config;
pub mod device;
pub mod heartbeat;
pub mod service;
pub mod stats;
pub mod stayon;
pub mod window;

// Re-export key types
pub use config::{Config, Voltages};
pub use device::{DeviceLink, PowerController, RegisterBus};
pub use heartbeat::{Clock, Heartbeat, SystemClock};
pub use stayon::StayOnOverride;
pub use window::RecurringWindow;
