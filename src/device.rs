//! Printer device properties.
//!
//! [`printer_table`] registers the standard property set exposed by the
//! daemon. Hardware access goes through the [`PowerSupply`] trait;
//! [`SimulatedDevice`] is an in-memory implementation used when no GPIO
//! backend is wired in, and by the test suite.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::TableBuildError;
use crate::property::{Interlock, PropertyTable};
use crate::value::{Color, PropertyValue, ValueKind};

/// Printer and LED states, in enumerant order.
pub const PRINTER_STATES: &[&str] = &[
    "OFF", "IDLE", "HEATING", "PRINTING", "COMPLETE", "CANCELED", "ERRORED",
];

/// Printer states during which the supply must stay on.
pub const ACTIVE_JOB_STATES: &[&str] = &["HEATING", "PRINTING"];

pub const PSU_POWER: &str = "psu_power";
pub const PRINTER_STATE: &str = "printer_state";
pub const LED_STATE: &str = "led_state";
pub const LED_IDLE_COLOR: &str = "led_idle_color";

/// Switchable power supply.
pub trait PowerSupply: Send + Sync {
    /// Request the supply be switched on or off.
    fn set_enabled(&self, enabled: bool) -> io::Result<()>;

    /// Observed supply state.
    fn is_enabled(&self) -> bool;
}

/// How long the `psu_power` setter waits for the supply to report the
/// requested state.
#[derive(Debug, Clone, Copy)]
pub struct PowerSettle {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for PowerSettle {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DeviceState {
    psu_power: bool,
    power_fault: bool,
    printer_state: PropertyValue,
    led_state: PropertyValue,
    led_idle_color: Color,
}

/// In-memory device state.
///
/// Clones share the same state, so one handle can back the property table
/// while another is driven by a print monitor or a test.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// Supply off, printer and LED idle, idle color full-saturation red.
    pub fn new() -> Self {
        let idle = PropertyValue::Enumerant {
            index: 1,
            name: "IDLE",
        };
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                psu_power: false,
                power_fault: false,
                printer_state: idle,
                led_state: idle,
                led_idle_color: Color::Hsb {
                    hue: 0,
                    saturation: 255,
                    brightness: 255,
                },
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn psu_power(&self) -> bool {
        self.lock().psu_power
    }

    pub fn printer_state(&self) -> &'static str {
        self.lock().printer_state.as_enumerant().unwrap_or("OFF")
    }

    /// Update the printer state, as a print monitor would.
    ///
    /// Returns `false` if `name` is not a known state.
    pub fn set_printer_state(&self, name: &str) -> bool {
        match PropertyValue::enumerant(PRINTER_STATES, name) {
            Some(value) => {
                self.lock().printer_state = value;
                true
            }
            None => false,
        }
    }

    /// Force the supply on or off without going through the property table.
    pub fn force_psu_power(&self, enabled: bool) {
        self.lock().psu_power = enabled;
    }

    /// While set, power requests are accepted but never take effect.
    pub fn set_power_fault(&self, fault: bool) {
        self.lock().power_fault = fault;
    }

    /// Build the standard table backed by this device.
    pub fn table(&self, settle: PowerSettle) -> Result<PropertyTable, TableBuildError> {
        printer_table(self, Arc::new(self.clone()), settle)
    }
}

impl PowerSupply for SimulatedDevice {
    fn set_enabled(&self, enabled: bool) -> io::Result<()> {
        let mut state = self.lock();
        if !state.power_fault {
            state.psu_power = enabled;
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.psu_power()
    }
}

/// Register the printer property set.
///
/// `psu_power` is read and switched through `psu`; the remaining properties
/// are held by `device`. Disabling the supply is refused while the printer
/// is heating or printing.
pub fn printer_table(
    device: &SimulatedDevice,
    psu: Arc<dyn PowerSupply>,
    settle: PowerSettle,
) -> Result<PropertyTable, TableBuildError> {
    let psu_get = Arc::clone(&psu);
    let (state_get, state_set) = (device.clone(), device.clone());
    let (led_get, led_set) = (device.clone(), device.clone());
    let (color_get, color_set) = (device.clone(), device.clone());

    let active_states = ACTIVE_JOB_STATES
        .iter()
        .filter_map(|name| PropertyValue::enumerant(PRINTER_STATES, name));

    PropertyTable::builder()
        .property(
            PSU_POWER,
            ValueKind::Boolean,
            move || PropertyValue::Boolean(psu_get.is_enabled()),
            move |candidate| match candidate.as_bool() {
                Some(enabled) => PropertyValue::Boolean(switch_power(psu.as_ref(), enabled, settle)),
                None => PropertyValue::Boolean(psu.is_enabled()),
            },
        )
        .property(
            PRINTER_STATE,
            ValueKind::Enumerant(PRINTER_STATES),
            move || state_get.lock().printer_state,
            move |candidate| {
                state_set.lock().printer_state = candidate;
                candidate
            },
        )
        .property(
            LED_STATE,
            ValueKind::Enumerant(PRINTER_STATES),
            move || led_get.lock().led_state,
            move |candidate| {
                led_set.lock().led_state = candidate;
                candidate
            },
        )
        .property(
            LED_IDLE_COLOR,
            ValueKind::Color,
            move || PropertyValue::Color(color_get.lock().led_idle_color),
            move |candidate| {
                let mut state = color_set.lock();
                if let Some(color) = candidate.as_color() {
                    state.led_idle_color = color;
                }
                PropertyValue::Color(state.led_idle_color)
            },
        )
        .interlock(
            Interlock::new(PSU_POWER, PropertyValue::Boolean(false))
                .while_in(PRINTER_STATE, active_states),
        )
        .build()
}

/// Switch the supply and wait for it to report the new state.
///
/// Returns the state in effect afterwards: `enabled` on success, the prior
/// state if the request failed or the supply did not settle in time.
fn switch_power(psu: &dyn PowerSupply, enabled: bool, settle: PowerSettle) -> bool {
    let before = psu.is_enabled();
    if before == enabled {
        return before;
    }

    if let Err(e) = psu.set_enabled(enabled) {
        warn!(error = %e, enabled, "Power supply request failed");
        return before;
    }

    let deadline = Instant::now() + settle.timeout;
    loop {
        if psu.is_enabled() == enabled {
            info!(enabled, "Power supply switched");
            return enabled;
        }
        if Instant::now() >= deadline {
            warn!(
                enabled,
                timeout_ms = settle.timeout.as_millis() as u64,
                "Power supply did not reach requested state"
            );
            return before;
        }
        thread::sleep(settle.poll_interval);
    }
}
