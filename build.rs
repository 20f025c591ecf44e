use std::io::Write;
use serde::Deserialize;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load the USB device table.
    println!("cargo:rerun-if-changed=devices.json");
    let json_devices = std::fs::read_to_string("devices.json")?;
    // Parse it, so we don't have to parse it at runtime.
    let devices: Vec<DeviceRecord> = serde_json::from_str(&json_devices)?;

    let out_dir = std::env::var("OUT_DIR")?;
    let out_dir = std::path::Path::new(&out_dir);
    let out_path = out_dir.join("devices.rs");

    let mut out = std::fs::File::create(out_path)?;

    // One row per VID/PID pair. Bootloader-mode and sketch-mode PIDs get
    // separate rows so lookups are a plain scan.
    writeln!(out, "static DEVICES: &[KnownDevice] = &[")?;
    for d in devices {
        let vid = parse_id(&d.vid)?;
        for (pid, bootloader) in [
            (parse_id(&d.bootloader_pid)?, true),
            (parse_id(&d.app_pid)?, false),
        ] {
            writeln!(out,
                "    KnownDevice {{ name: {:?}, vid: {:#06x}, pid: {:#06x}, bootloader: {} }},",
                d.name,
                vid,
                pid,
                bootloader)?;
        }
    }
    writeln!(out, "];")?;

    Ok(())
}

fn parse_id(s: &str) -> Result<u16, Box<dyn std::error::Error>> {
    Ok(if let Some(hex) = s.strip_prefix("0x") {
        u16::from_str_radix(hex, 16)?
    } else {
        s.parse()?
    })
}

#[derive(Deserialize)]
struct DeviceRecord {
    name: String,
    vid: String,
    bootloader_pid: String,
    app_pid: String,
}
