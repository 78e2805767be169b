/*!
 # PMU register access

 Point-to-point register protocol for the power-management
 microcontroller on the I2C bus: presence detection, serialized retried
 transactions, and the domain operations (watchdog, power-off, battery
 sampling, wifi link state) layered on top.
*/

use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::Voltages;
use crate::{Error, Result};

/// Fixed bus address of the PMU.
pub const PMU_ADDRESS: u16 = 0x04;

const SLEEP_REG: u8 = 0x11;
const WATCHDOG_REG: u8 = 0x12;
const WIFI_STATE_REG: u8 = 0x13;
const BATTERY_LO_REG: u8 = 0x20;
const BATTERY_HI_REG: u8 = 0x21;
const VERSION_REG: u8 = 0x22;

// 3 was just randomly chosen as the byte the PMU returns to indicate
// its presence.
const PRESENCE_MAGIC: u8 = 0x03;

/// Protocol version the battery and wifi-state registers first appeared in.
pub const WANTED_VERSION: u8 = 4;

// Probe for the PMU for up to a minute.
const MAX_CONNECT_ATTEMPTS: u32 = 20;
const CONNECT_ATTEMPT_INTERVAL: Duration = Duration::from_secs(3);

// Parameters for transaction retries.
const MAX_TX_ATTEMPTS: u32 = 5;
const TX_RETRY_INTERVAL: Duration = Duration::from_secs(1);

// The PMU answers 127 on either battery byte while an analog conversion
// is in flight; such samples must be discarded.
const INVALID_SAMPLE: u8 = 127;
const MAX_BATTERY_SAMPLE_ATTEMPTS: u32 = 10;

/// One addressed exchange on the shared bus: write `write` (register
/// select plus payload) if non-empty, then read into `read` if
/// non-empty. Implemented by the real I2C bus and by scripted buses in
/// tests.
pub trait RegisterBus: Send {
    fn transact(&mut self, write: &[u8], read: &mut [u8]) -> Result<()>;
}

/// The production bus: the Pi's I2C peripheral with the PMU selected as
/// the slave address.
pub struct I2cRegisterBus {
    i2c: rppal::i2c::I2c,
}

impl I2cRegisterBus {
    pub fn open() -> Result<Self> {
        let mut i2c = rppal::i2c::I2c::new()?;
        i2c.set_slave_address(PMU_ADDRESS)?;
        Ok(Self { i2c })
    }
}

impl RegisterBus for I2cRegisterBus {
    fn transact(&mut self, write: &[u8], read: &mut [u8]) -> Result<()> {
        let res = match (write.is_empty(), read.is_empty()) {
            (false, false) => self.i2c.write_read(write, read),
            (false, true) => self.i2c.write(write).map(|_| ()),
            (true, false) => self.i2c.read(read).map(|_| ()),
            (true, true) => Ok(()),
        };
        res.map_err(|e| Error::Bus(e.to_string()))
    }
}

/// Reliable register access to the PMU. Every transaction is serialized
/// behind one lock and retried a bounded number of times before the
/// error is surfaced.
pub struct DeviceLink {
    bus: Mutex<Box<dyn RegisterBus>>,
    version: u8,
}

impl DeviceLink {
    /// Probes the bus for the PMU and, once detected, reads its protocol
    /// version. Returns `Ok(None)` if nothing answers the probe before
    /// the attempts run out; that is a valid outcome, not an error.
    pub async fn connect(mut bus: Box<dyn RegisterBus>) -> Result<Option<DeviceLink>> {
        if !detect_presence(bus.as_mut()).await {
            return Ok(None);
        }

        let mut link = DeviceLink {
            bus: Mutex::new(bus),
            version: 0,
        };
        link.version = link.read_register(VERSION_REG).await?;
        info!("PMU version: {}", link.version);
        if link.version < WANTED_VERSION {
            warn!(
                "wanted PMU version {WANTED_VERSION} or higher, have version {}. \
                 Some features won't be available",
                link.version
            );
        }
        Ok(Some(link))
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Fails fast when the detected firmware predates `need`, naming the
    /// operation that was refused.
    pub fn require_version(&self, need: u8, op: &'static str) -> Result<()> {
        if self.version < need {
            return Err(Error::UnsupportedVersion {
                op,
                have: self.version,
                need,
            });
        }
        Ok(())
    }

    /// Reads a single byte from `reg`.
    pub async fn read_register(&self, reg: u8) -> Result<u8> {
        let mut b = [0u8; 1];
        self.tx(&[reg], &mut b).await?;
        Ok(b[0])
    }

    /// Writes `payload` to `reg`. An empty payload is a bare register
    /// poke (used by the watchdog).
    pub async fn write_register(&self, reg: u8, payload: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(1 + payload.len());
        buf.push(reg);
        buf.extend_from_slice(payload);
        self.tx(&buf, &mut []).await
    }

    /// One logical transaction. The lock is held for the duration of the
    /// transaction including its retries, and released before the caller
    /// issues the next one.
    async fn tx(&self, write: &[u8], read: &mut [u8]) -> Result<()> {
        let mut bus = self.bus.lock().await;
        let mut attempt = 0;
        loop {
            match bus.transact(write, read) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if attempt >= MAX_TX_ATTEMPTS {
                        return Err(err);
                    }
                    warn!("bus transaction failed (attempt {attempt}/{MAX_TX_ATTEMPTS}): {err}");
                    time::sleep(TX_RETRY_INTERVAL).await;
                }
            }
        }
    }
}

/// Boot-time probe: a 1-byte read with no register select, answered with
/// the magic byte when the PMU is alive. Gives up permanently after the
/// attempt cap.
async fn detect_presence(bus: &mut dyn RegisterBus) -> bool {
    for attempt in 1..=MAX_CONNECT_ATTEMPTS {
        let mut b = [0u8; 1];
        match bus.transact(&[], &mut b) {
            Ok(()) if b[0] == PRESENCE_MAGIC => return true,
            Ok(()) => trace!("presence probe answered {:#04x}", b[0]),
            Err(err) => trace!("presence probe failed: {err}"),
        }
        if attempt < MAX_CONNECT_ATTEMPTS {
            debug!("PMU not detected yet (attempt {attempt}/{MAX_CONNECT_ATTEMPTS})");
            time::sleep(CONNECT_ATTEMPT_INTERVAL).await;
        }
    }
    false
}

/// Domain operations on the PMU.
pub struct PowerController {
    link: Arc<DeviceLink>,
    voltages: Voltages,
    wifi_interface: String,
    on_battery: parking_lot::Mutex<Option<bool>>,
    // Last state pushed to the wifi register; the lock also serializes
    // the compare-and-write sequence.
    wifi_link_up: Mutex<Option<bool>>,
}

impl PowerController {
    pub fn new(link: Arc<DeviceLink>, voltages: Voltages, wifi_interface: String) -> Self {
        Self {
            link,
            voltages,
            wifi_interface,
            on_battery: parking_lot::Mutex::new(None),
            wifi_link_up: Mutex::new(None),
        }
    }

    pub fn version(&self) -> u8 {
        self.link.version()
    }

    /// Services the PMU watchdog timer to stop it from power-cycling the
    /// host. Must be called about once a minute for the life of the
    /// process.
    #[instrument(skip(self))]
    pub async fn ping_watchdog(&self) -> Result<()> {
        self.link.write_register(WATCHDOG_REG, &[]).await
    }

    /// Asks the PMU to cut power to the host for `minutes`. Does nothing
    /// for zero or negative values. The PMU cuts power after the delay
    /// regardless of OS state, so callers must flush storage first.
    #[instrument(skip(self))]
    pub async fn request_power_off(&self, minutes: i64) -> Result<()> {
        if minutes <= 0 {
            return Ok(());
        }
        let m = u16::try_from(minutes).unwrap_or(u16::MAX);
        self.link.write_register(SLEEP_REG, &m.to_be_bytes()).await
    }

    /// Reads the raw analog value from the battery sense pin, low byte
    /// then high byte, combined big-endian. Samples carrying the
    /// invalid-read sentinel in either byte are discarded and re-read,
    /// up to a bounded attempt count.
    #[instrument(skip(self))]
    pub async fn read_battery_level(&self) -> Result<u16> {
        self.link
            .require_version(WANTED_VERSION, "read_battery_level")?;
        if !self.voltages.enable {
            return Ok(0);
        }

        for attempt in 1..=MAX_BATTERY_SAMPLE_ATTEMPTS {
            let lo = self.link.read_register(BATTERY_LO_REG).await?;
            let hi = self.link.read_register(BATTERY_HI_REG).await?;
            if lo == INVALID_SAMPLE || hi == INVALID_SAMPLE {
                trace!("discarding in-flight battery sample (attempt {attempt})");
                continue;
            }
            return Ok(u16::from_be_bytes([hi, lo]));
        }
        Err(Error::BatterySample(MAX_BATTERY_SAMPLE_ATTEMPTS))
    }

    /// Whether the host runs from a battery rather than mains. The
    /// classification is made once against the configured threshold and
    /// held for the process lifetime.
    #[instrument(skip(self))]
    pub async fn is_on_battery(&self) -> Result<bool> {
        self.link.require_version(WANTED_VERSION, "is_on_battery")?;
        if let Some(cached) = *self.on_battery.lock() {
            return Ok(cached);
        }
        let level = self.read_battery_level().await?;
        let on = level > self.voltages.no_battery;
        *self.on_battery.lock() = Some(on);
        Ok(on)
    }

    /// Mirrors the wifi interface's link state into the PMU's wifi
    /// register, writing only when the state actually changed.
    #[instrument(skip(self))]
    pub async fn sync_wifi_link_state(&self) -> Result<()> {
        self.link
            .require_version(WANTED_VERSION, "sync_wifi_link_state")?;

        let mut last = self.wifi_link_up.lock().await;
        let output = Command::new("ip")
            .args(["a", "show", &self.wifi_interface])
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Command {
                cmd: format!("ip a show {}", self.wifi_interface),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let up = String::from_utf8_lossy(&output.stdout).contains("state UP");
        if *last == Some(up) {
            return Ok(());
        }
        self.link
            .write_register(WIFI_STATE_REG, &[u8::from(up)])
            .await?;
        *last = Some(up);
        info!("updated wifi link state to '{up}'");
        Ok(())
    }
}
