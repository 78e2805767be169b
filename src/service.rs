/*!
 # D-Bus notification endpoint

 Exposes the PMU to other processes on the system bus. Each method maps
 one-to-one onto a power-controller operation; errors carry the
 operation name so callers can tell what was refused.
*/

use std::sync::Arc;

use chrono::Local;
use tracing::info;
use zbus::{connection, fdo, interface};

use crate::device::PowerController;
use crate::stayon::StayOnOverride;
use crate::Result;

pub const BUS_NAME: &str = "nz.oturu.PmuController";
pub const OBJECT_PATH: &str = "/nz/oturu/PmuController";

pub struct PmuService {
    controller: Option<Arc<PowerController>>,
    stay_on: Arc<StayOnOverride>,
}

#[interface(name = "nz.oturu.PmuController1")]
impl PmuService {
    /// Whether a PMU was detected on the bus.
    async fn is_present(&self) -> bool {
        self.controller.is_some()
    }

    /// Delays turning the host off for `minutes`. Rejected when the
    /// resulting deadline lies more than 12 hours out.
    async fn stay_on_for(&self, minutes: u32) -> fdo::Result<()> {
        self.stay_on
            .stay_on_for(i64::from(minutes), Local::now())
            .map_err(|err| op_error("StayOnFor", err))
    }

    /// Raw analog value of the PMU's battery sense pin.
    async fn read_battery_pin(&self) -> fdo::Result<u16> {
        self.controller()?
            .read_battery_level()
            .await
            .map_err(|err| op_error("ReadBatteryPin", err))
    }

    /// Whether the host runs from a battery rather than mains.
    async fn on_battery(&self) -> fdo::Result<bool> {
        self.controller()?
            .is_on_battery()
            .await
            .map_err(|err| op_error("OnBattery", err))
    }
}

impl PmuService {
    fn controller(&self) -> fdo::Result<&Arc<PowerController>> {
        self.controller
            .as_ref()
            .ok_or_else(|| fdo::Error::Failed("no PMU present".into()))
    }
}

fn op_error(op: &str, err: crate::Error) -> fdo::Error {
    fdo::Error::Failed(format!("{op}: {err}"))
}

/// Claims the well-known name on the system bus and serves the
/// endpoint. The returned connection must be kept alive for the life
/// of the process.
pub async fn start(
    controller: Option<Arc<PowerController>>,
    stay_on: Arc<StayOnOverride>,
) -> Result<zbus::Connection> {
    let service = PmuService { controller, stay_on };
    let conn = connection::Builder::system()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;
    info!("serving D-Bus endpoint as {BUS_NAME}");
    Ok(conn)
}
