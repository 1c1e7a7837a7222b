//! Auger relay control. The `gpio` feature gates the real rppal driver;
//! without it, a mock relay only logs and remembers its state.

use anyhow::{bail, Result};
use std::time::Duration;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Longest single run, whatever the requested quantity.
pub(crate) const MAX_RUN: Duration = Duration::from_secs(120);

/// Auger throughput in kg/s for each feeder aperture (mm).
pub(crate) fn feed_rate_kg_per_s(diameter_mm: u32) -> Option<f64> {
    match diameter_mm {
        20 => Some(0.05),
        30 => Some(0.10),
        40 => Some(0.20),
        _ => None,
    }
}

/// How long to run the auger to dispense `kg`, capped at [`MAX_RUN`].
pub(crate) fn run_duration(kg: f64, diameter_mm: u32) -> Result<Duration> {
    if !kg.is_finite() || kg <= 0.0 {
        bail!("quantity must be positive, got {kg} kg");
    }
    let Some(rate) = feed_rate_kg_per_s(diameter_mm) else {
        bail!("unsupported feeder diameter {diameter_mm} mm");
    };
    Ok(Duration::from_secs_f64(kg / rate).min(MAX_RUN))
}

// ---------------------------------------------------------------------------
// Real GPIO relay (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct Auger {
    pin: OutputPin,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl Auger {
    pub(crate) fn new(gpio_pin: u8, active_low: bool) -> Result<Self> {
        let mut pin = Gpio::new()?.get(gpio_pin)?.into_output();
        // Fail-safe: motor stopped at startup.
        if active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(gpio = gpio_pin, active_low, "auger relay ready");
        Ok(Self { pin, active_low })
    }

    pub(crate) fn set(&mut self, on: bool) {
        // active-low: LOW = running
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        info!("auger {}", if on { "ON" } else { "OFF" });
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct Auger {
    pub(crate) running: bool,
    pub(crate) runs: u32,
}

#[cfg(not(feature = "gpio"))]
impl Auger {
    pub(crate) fn new(gpio_pin: u8, _active_low: bool) -> Result<Self> {
        info!(gpio = gpio_pin, "[mock-gpio] auger relay initialised (not wired)");
        Ok(Self {
            running: false,
            runs: 0,
        })
    }

    pub(crate) fn set(&mut self, on: bool) {
        if on && !self.running {
            self.runs += 1;
        }
        self.running = on;
        info!("[mock-gpio] auger {}", if on { "ON" } else { "OFF" });
    }
}

impl Auger {
    /// Run the motor for `duration`, then stop it.
    pub(crate) async fn run_for(&mut self, duration: Duration) {
        self.set(true);
        tokio::time::sleep(duration).await;
        self.set(false);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
