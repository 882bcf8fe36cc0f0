//! Parsers for `adb` command output.

use std::collections::BTreeMap;

use crate::transport::{DeviceEvent, DeviceSummary, Properties, TransportError};

/// Connection state `adb` reports for a device that accepts commands.
pub const ONLINE_STATE: &str = "device";

const VERSION_PREFIX: &str = "Android Debug Bridge version ";

/// Serial to connection state, as reported by one device listing.
pub type Snapshot = BTreeMap<String, String>;

/// Extracts the protocol version from `adb version` output.
///
/// # Errors
///
/// Returns [`TransportError::Protocol`] when no version line is present.
pub fn parse_version(output: &str) -> Result<String, TransportError> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(VERSION_PREFIX))
        .map(|version| version.trim().to_owned())
        .filter(|version| !version.is_empty())
        .ok_or_else(|| TransportError::Protocol {
            message: format!("no version in `adb version` output: {}", output.trim()),
        })
}

/// Parses a device listing of `serial<TAB>state` lines.
///
/// Headers, blank lines and daemon chatter carry no tab and are skipped.
#[must_use]
pub fn parse_device_list(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter_map(|line| {
            let (raw_serial, rest) = line.split_once('\t')?;
            let serial = raw_serial.trim();
            let state = rest.split_whitespace().next().unwrap_or_default();
            (!serial.is_empty()).then(|| DeviceSummary {
                serial: serial.to_owned(),
                state: state.to_owned(),
            })
        })
        .collect()
}

/// Parses `getprop` output of `[key]: [value]` lines.
#[must_use]
pub fn parse_getprop(output: &str) -> Properties {
    output
        .lines()
        .filter_map(|line| {
            let (raw_key, raw_value) = line.trim().split_once("]: [")?;
            let key = raw_key.strip_prefix('[')?;
            let value = raw_value.strip_suffix(']')?;
            Some((key.to_owned(), value.to_owned()))
        })
        .collect()
}

/// Returns `true` when `pm path` output names an installed package file.
#[must_use]
pub fn package_path_present(output: &str) -> bool {
    output
        .lines()
        .any(|line| line.trim_start().starts_with("package:"))
}

/// Decodes the 4-digit hex length prefix of a `track-devices` frame.
///
/// # Errors
///
/// Returns [`TransportError::Protocol`] when the prefix is not hex.
pub fn frame_length(prefix: [u8; 4]) -> Result<usize, TransportError> {
    std::str::from_utf8(&prefix)
        .ok()
        .and_then(|text| usize::from_str_radix(text, 16).ok())
        .ok_or_else(|| TransportError::Protocol {
            message: format!(
                "invalid track-devices length prefix {:?}",
                String::from_utf8_lossy(&prefix)
            ),
        })
}

/// Builds a snapshot from a device listing.
#[must_use]
pub fn snapshot(devices: Vec<DeviceSummary>) -> Snapshot {
    devices
        .into_iter()
        .map(|device| (device.serial, device.state))
        .collect()
}

fn online(snapshot: &Snapshot, serial: &str) -> bool {
    snapshot
        .get(serial)
        .is_some_and(|state| state == ONLINE_STATE)
}

/// Turns two consecutive snapshots into attach/detach events.
///
/// Only the `device` state counts as online. Detaches are reported before
/// attaches, each in serial order.
#[must_use]
pub fn diff_snapshots(previous: &Snapshot, current: &Snapshot) -> Vec<DeviceEvent> {
    let gone = previous
        .keys()
        .filter(|serial| online(previous, serial) && !online(current, serial))
        .map(|serial| DeviceEvent::WentOffline {
            serial: serial.clone(),
        });
    let arrived = current
        .keys()
        .filter(|serial| online(current, serial) && !online(previous, serial))
        .map(|serial| DeviceEvent::CameOnline {
            serial: serial.clone(),
        });
    gone.chain(arrived).collect()
}
