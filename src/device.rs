// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Finding Arduboys on serial ports and getting them into the bootloader.

use std::fmt;
use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use serialport::{SerialPort, SerialPortType};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::protocol::{Exit, Session, SessionConfig};

/// A USB id pair the tool recognizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KnownDevice {
    pub name: &'static str,
    pub vid: u16,
    pub pid: u16,
    /// The id is the one the board uses while in its bootloader.
    pub bootloader: bool,
}

include!(concat!(env!("OUT_DIR"), "/devices.rs"));

/// Opening the port at this baud rate and closing it again asks the sketch
/// to reboot into the bootloader.
const RESET_BAUD: u32 = 1200;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Freshly enumerated ports sometimes refuse to open right away.
const CONNECT_WAIT: Duration = Duration::from_millis(100);

pub fn known_devices() -> &'static [KnownDevice] {
    DEVICES
}

pub fn identify(vid: u16, pid: u16) -> Option<&'static KnownDevice> {
    DEVICES.iter().find(|d| d.vid == vid && d.pid == pid)
}

/// An attached board, as seen when the port list was read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub port: String,
    pub vid: u16,
    pub pid: u16,
    pub name: &'static str,
    pub bootloader: bool,
}

impl Device {
    fn from_usb(port: &str, vid: u16, pid: u16) -> Option<Self> {
        identify(vid, pid).map(|known| Self {
            port: port.to_string(),
            vid,
            pid,
            name: known.name,
            bootloader: known.bootloader,
        })
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04X}:{:04X} ({})", self.vid, self.pid, self.port)?;
        if self.bootloader {
            write!(f, "[bootloader]")?;
        }
        Ok(())
    }
}

/// Lists attached boards, in the order the OS reports their ports.
pub fn find_devices() -> Result<Vec<Device>> {
    let ports = serialport::available_ports()
        .map_err(|e| Error::io("list serial ports", "system", e.into()))?;
    let devices: Vec<Device> = ports.iter()
        .filter_map(|p| match &p.port_type {
            SerialPortType::UsbPort(usb) => Device::from_usb(&p.port_name, usb.vid, usb.pid),
            _ => None,
        })
        .collect();
    for d in &devices {
        debug!("found {} ({})", d, d.name);
    }
    Ok(devices)
}

/// Makes sure `device` is in bootloader mode, rebooting it if needed, and
/// returns it as it appears afterwards (often on a different port).
pub fn reset_to_bootloader(device: &Device, config: &SessionConfig) -> Result<Device> {
    if device.bootloader {
        return Ok(device.clone());
    }
    // Boards already in the bootloader aren't the one we're waiting for.
    let waiting: Vec<String> = find_devices()?
        .into_iter()
        .filter(|d| d.bootloader)
        .map(|d| d.port)
        .collect();

    info!("resetting {}", device);
    let port = serialport::new(&device.port, RESET_BAUD)
        .timeout(config.timeout)
        .open()
        .map_err(|e| Error::io("reset", &device.port, e.into()))?;
    drop(port);

    await_bootloader(device, &waiting, config.reconnect_wait, find_devices, thread::sleep)
}

/// Polls `scan` until `device`'s application port is gone and then until a
/// bootloader not in `waiting` shows up, sleeping longer between polls each
/// time. Sleeps add up to at most `wait`.
fn await_bootloader(
    device: &Device,
    waiting: &[String],
    wait: Duration,
    mut scan: impl FnMut() -> Result<Vec<Device>>,
    mut sleep: impl FnMut(Duration),
) -> Result<Device> {
    let mut slept = Duration::ZERO;
    let mut delay = POLL_INTERVAL;
    let mut vanished = false;
    loop {
        let step = delay.min(wait.saturating_sub(slept));
        if step.is_zero() {
            let state = if vanished { "reappear in bootloader mode" } else { "disconnect" };
            return Err(Error::DeviceNotFound {
                what: format!("{} did not {} within {:?}", device, state, wait),
            });
        }
        sleep(step);
        slept += step;
        delay = (delay * 2).min(MAX_POLL_INTERVAL);

        let devices = scan()?;
        if !vanished {
            vanished = !devices.iter().any(|d| d.port == device.port && !d.bootloader);
            if !vanished {
                continue;
            }
            debug!("{} has disconnected", device);
        }
        let found = devices.into_iter()
            .find(|d| d.bootloader && !waiting.contains(&d.port));
        if let Some(found) = found {
            info!("{} is back as {}", device, found);
            return Ok(found);
        }
    }
}

/// Resets `device` if needed and opens a bootloader session on it.
pub fn connect(device: &Device, config: &SessionConfig) -> Result<Session<Box<dyn SerialPort>>> {
    let device = reset_to_bootloader(device, config)?;
    thread::sleep(CONNECT_WAIT);
    let port = serialport::new(&device.port, config.baud)
        .timeout(config.timeout)
        .open()
        .map_err(|e| Error::io("open", &device.port, e.into()))?;
    Ok(Session::new(port, device.port.clone(), config.clone()))
}

/// Runs `op` in a session on every device, leaving each one via `exit`.
///
/// A failing device doesn't stop the others; its error is logged and
/// returned in its position of the result list.
pub fn for_each_device<R: Send>(
    devices: &[Device],
    config: &SessionConfig,
    exit: Exit,
    parallel: bool,
    op: impl Fn(&mut Session<Box<dyn SerialPort>>) -> Result<R> + Sync,
) -> Vec<Result<R>> {
    run_batch(devices, parallel, |d| connect(d, config), exit, op)
}

fn run_batch<D, T, R>(
    items: &[D],
    parallel: bool,
    connect: impl Fn(&D) -> Result<Session<T>> + Sync,
    exit: Exit,
    op: impl Fn(&mut Session<T>) -> Result<R> + Sync,
) -> Vec<Result<R>>
where
    D: fmt::Display + Sync,
    T: Read + Write,
    R: Send,
{
    let run_one = |item: &D| -> Result<R> {
        let result = connect(item).and_then(|session| session.run(exit, &op));
        if let Err(e) = &result {
            error!("{}: {}", item, e);
        }
        result
    };

    if !parallel {
        return items.iter().map(run_one).collect();
    }
    thread::scope(|s| {
        let handles: Vec<_> = items.iter()
            .map(|item| s.spawn(|| run_one(item)))
            .collect();
        handles.into_iter()
            .zip(items)
            .map(|(h, item)| h.join().unwrap_or_else(|_| {
                error!("{}: worker panicked", item);
                Err(Error::io(
                    "batch",
                    &item.to_string(),
                    io::Error::new(io::ErrorKind::Other, "worker panicked"),
                ))
            }))
            .collect()
    })
}
