//! Device resolution over the bridge
//!
//! Finds an attached emulator matching a model tag, launching one through
//! the bridge when none is attached yet.

use std::sync::Arc;
use std::time::Duration;

use devherd_core::prelude::*;
use devherd_core::DeviceBinding;

use crate::bridge::BridgeApi;

/// Interval between device polls while an emulator boots
pub const DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Polls after a launch request before giving up
pub const DEVICE_POLL_ATTEMPTS: u32 = 15;

const AVD_NAME_PROP: &str = "ro.boot.qemu.avd_name";
const MODEL_PROP: &str = "ro.product.model";

/// Family aliases: a short tag matches any of its device names
const MODEL_ALIASES: &[(&str, &[&str])] = &[
    ("atv", &["atv", "tv"]),
    ("wear", &["wear"]),
    ("tablet", &["tablet"]),
    ("gpc", &["gpc", "desktop"]),
    ("phone", &["gphone"]),
];

/// Serials of attached devices from `adb devices` output.
///
/// The bridge host is Windows, so lines may end in `\r\n`. Only devices in
/// state `device` count; `offline` and `unauthorized` are skipped.
pub fn parse_adb_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.starts_with("List of devices"))
        .filter_map(|l| {
            let mut cols = l.split('\t');
            let serial = cols.next()?.trim();
            let state = cols.next()?.trim();
            (state == "device" && !serial.is_empty()).then(|| serial.to_string())
        })
        .collect()
}

/// Serial of the emulator listening on console `port`
pub fn emulator_serial(port: u16) -> String {
    format!("emulator-{}", port)
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase().replace('_', " ")
}

/// Whether a reported AVD name or model matches `model_tag`.
///
/// Case-insensitive substring in either direction after mapping `_` to
/// space, plus the family aliases.
pub fn model_matches(detected: &str, model_tag: &str) -> bool {
    let detected = normalize(detected);
    let tag = normalize(model_tag);
    if detected.is_empty() || tag.is_empty() {
        return false;
    }
    if detected.contains(&tag) || tag.contains(&detected) {
        return true;
    }
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == tag)
        .map(|(_, names)| names.iter().any(|n| detected.contains(n)))
        .unwrap_or(false)
}

/// Resolves model tags to device serials through a bridge
pub struct DeviceResolver {
    bridge: Arc<dyn BridgeApi>,
    poll_interval: Duration,
    max_attempts: u32,
}

impl DeviceResolver {
    pub fn new(bridge: Arc<dyn BridgeApi>) -> Self {
        Self {
            bridge,
            poll_interval: DEVICE_POLL_INTERVAL,
            max_attempts: DEVICE_POLL_ATTEMPTS,
        }
    }

    pub fn with_polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = interval;
        self.max_attempts = max_attempts;
        self
    }

    /// Find an attached device matching `model_tag`.
    ///
    /// Returns `emulator-<preferred_port>` straight from the device list when
    /// it is attached. Otherwise asks each device for its AVD name, then its
    /// model. Bridge failures read as "not found".
    pub async fn find_device_serial(&self, model_tag: &str, preferred_port: u16) -> Option<String> {
        let listing = match self.bridge.adb("devices").await {
            Ok(out) => out.stdout,
            Err(e) => {
                debug!("adb devices via bridge failed: {}", e);
                return None;
            }
        };
        let serials = parse_adb_devices(&listing);

        let preferred = emulator_serial(preferred_port);
        if serials.iter().any(|s| *s == preferred) {
            return Some(preferred);
        }

        for serial in serials {
            for prop in [AVD_NAME_PROP, MODEL_PROP] {
                let args = format!("-s {} shell getprop {}", serial, prop);
                match self.bridge.adb(&args).await {
                    Ok(out) if model_matches(&out.stdout, model_tag) => {
                        debug!("{} matched '{}' via {}", serial, model_tag, prop);
                        return Some(serial);
                    }
                    Ok(_) => {}
                    Err(e) => debug!("getprop {} on {} failed: {}", prop, serial, e),
                }
            }
        }

        None
    }

    /// Return a serial for the bound device, launching its emulator if needed.
    ///
    /// `progress` receives human-readable status lines for the service log.
    pub async fn ensure_device_ready(
        &self,
        binding: &DeviceBinding,
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> Result<String> {
        let model = binding.emulator_model_tag.as_str();
        if let Some(serial) = self.find_device_serial(model, binding.bridge_port).await {
            return Ok(serial);
        }

        progress(format!(
            "No device matching '{}', launching emulator {} on port {}",
            model, binding.avd, binding.bridge_port
        ));
        self.bridge
            .launch_emulator(&binding.avd, binding.bridge_port)
            .await?;

        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.poll_interval).await;
            if let Some(serial) = self.find_device_serial(model, binding.bridge_port).await {
                return Ok(serial);
            }
            progress(format!(
                "Device matching '{}' not found yet ({}/{})",
                model, attempt, self.max_attempts
            ));
        }

        Err(Error::DeviceTimeout {
            model: model.to_string(),
            attempts: self.max_attempts,
        })
    }
}
