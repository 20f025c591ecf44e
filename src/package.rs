// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `.arduboy` game packages.
//!
//! A package is a zip archive holding an `info.json` manifest plus, for each
//! device the game supports, a hex file and optional FX data, FX save and
//! title image. Older archives have no manifest; for those the first hex
//! file, `fxdata.bin`, `fxsave.bin` and a PNG are picked up by name.

use std::io::{Cursor, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::cart::{Slot, SlotMeta};
use crate::error::{Error, Result};
use crate::{hex, sketch, title};

pub const DEVICES: &[&str] = &["Arduboy", "ArduboyFX", "ArduboyMini"];
pub const DEFAULT_DEVICE: &str = "Arduboy";

const MANIFEST: &str = "info.json";
const SCHEMA_VERSION: u32 = 4;
const LEGACY_DATA: &str = "fxdata.bin";
const LEGACY_SAVE: &str = "fxsave.bin";
const LEGACY_TITLE: &str = "title.png";
/// Shown on the website, never a title screen.
const BANNER: &str = "banner.png";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

/// One device's build of the game.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArduboyBinary {
    pub device: String,
    pub title: Option<String>,
    /// Intel HEX text, kept verbatim.
    pub hex: String,
    pub data: Vec<u8>,
    pub save: Vec<u8>,
    /// Title screen as PNG.
    pub cart_image: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArduboyPackage {
    pub title: Option<String>,
    pub version: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub genre: Option<String>,
    pub date: Option<String>,
    pub url: Option<String>,
    pub source_url: Option<String>,
    pub email: Option<String>,
    pub publisher: Option<String>,
    /// Link to a companion app or page.
    pub companion: Option<String>,
    pub contributors: Vec<Contributor>,
    pub binaries: Vec<ArduboyBinary>,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema_version: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    publisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    companion: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    contributors: Vec<Contributor>,
    #[serde(default)]
    binaries: Vec<ManifestBinary>,

    // Older manifests credit people in one field per role. These are read
    // into `contributors` and never written.
    #[serde(default, skip_serializing)]
    idea: Option<String>,
    #[serde(default, skip_serializing)]
    code: Option<String>,
    #[serde(default, skip_serializing)]
    art: Option<String>,
    #[serde(default, skip_serializing)]
    sound: Option<String>,
}

impl Manifest {
    /// `contributors` with the old per-role credits folded in.
    fn take_contributors(&mut self) -> Vec<Contributor> {
        let mut contributors = std::mem::take(&mut self.contributors);
        let legacy = [
            ("Idea", self.idea.take()),
            ("Code", self.code.take()),
            ("Art", self.art.take()),
            ("Sound", self.sound.take()),
        ];
        for (role, name) in legacy {
            let Some(name) = name.filter(|n| !n.trim().is_empty()) else {
                continue;
            };
            let name = name.trim();
            match contributors.iter_mut().find(|c| c.name == name) {
                Some(c) => {
                    if !c.contributions.iter().any(|r| r == role) {
                        c.contributions.push(role.to_string());
                    }
                }
                None => contributors.push(Contributor {
                    name: name.to_string(),
                    contributions: vec![role.to_string()],
                    urls: Vec::new(),
                }),
            }
        }
        contributors
    }
}

#[derive(Default, Serialize, Deserialize)]
struct ManifestBinary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    flashdata: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    flashsave: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cartimage: Option<String>,
}

/// Zip contents, looked up by case-insensitive name.
struct Archive<R> {
    zip: ZipArchive<R>,
    names: Vec<String>,
}

impl<R: Read + std::io::Seek> Archive<R> {
    fn new(reader: R) -> Result<Self> {
        let zip = ZipArchive::new(reader)
            .map_err(|e| Error::package(format!("not a zip archive: {}", e)))?;
        let names = zip.file_names().map(String::from).collect();
        Ok(Self { zip, names })
    }

    fn find(&self, name: &str) -> Option<String> {
        self.names.iter().find(|n| n.eq_ignore_ascii_case(name)).cloned()
    }

    fn find_suffix(&self, suffix: &str) -> Option<String> {
        self.names.iter()
            .find(|n| n.to_ascii_lowercase().ends_with(suffix))
            .cloned()
    }

    fn read(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut file = self.zip.by_name(name)
            .map_err(|e| Error::package(format!("reading {}: {}", name, e)))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| Error::package(format!("reading {}: {}", name, e)))?;
        Ok(bytes)
    }

    fn read_text(&mut self, name: &str) -> Result<String> {
        String::from_utf8(self.read(name)?)
            .map_err(|_| Error::package(format!("{} is not UTF-8 text", name)))
    }

    /// Reads a file the manifest points at, or nothing if it's not named or
    /// not there.
    fn read_optional(&mut self, name: Option<&str>) -> Result<Option<Vec<u8>>> {
        let Some(name) = name else {
            return Ok(None);
        };
        match self.find(name) {
            Some(actual) => self.read(&actual).map(Some),
            None => {
                warn!("package names {} but doesn't contain it", name);
                Ok(None)
            }
        }
    }
}

impl ArduboyPackage {
    /// Reads a package, or a bare `.hex` file as a one-binary package.
    pub fn read(path: &Path) -> Result<Self> {
        debug!("reading package {}", path.display());
        let bytes = std::fs::read(path)
            .map_err(|e| Error::io("read package", &path.display().to_string(), e))?;
        let is_hex = path.extension()
            .map_or(false, |e| e.eq_ignore_ascii_case("hex"));
        if is_hex {
            let text = String::from_utf8(bytes)
                .map_err(|_| Error::package(format!("{} is not text", path.display())))?;
            return Ok(Self::from_hex(text));
        }
        Self::from_zip_bytes(&bytes)
    }

    /// A package holding just a sketch for the default device.
    pub fn from_hex(hex: String) -> Self {
        Self {
            binaries: vec![ArduboyBinary {
                device: DEFAULT_DEVICE.to_string(),
                title: None,
                hex,
                data: Vec::new(),
                save: Vec::new(),
                cart_image: None,
            }],
            ..Self::default()
        }
    }

    pub fn from_zip_bytes(bytes: &[u8]) -> Result<Self> {
        let mut archive = Archive::new(Cursor::new(bytes))?;

        let manifest = match archive.find(MANIFEST) {
            Some(name) => {
                let text = archive.read(&name)?;
                match serde_json::from_slice::<Manifest>(&text) {
                    Ok(m) => Some(m),
                    Err(e) => {
                        warn!("unreadable {}, treating as a legacy archive: {}", MANIFEST, e);
                        None
                    }
                }
            }
            None => None,
        };
        let mut manifest = manifest.unwrap_or_default();

        let mut binaries = Vec::new();
        for entry in std::mem::take(&mut manifest.binaries) {
            let hex_name = match &entry.filename {
                Some(f) => archive.find(f),
                None => archive.find_suffix(".hex"),
            };
            let Some(hex_name) = hex_name else {
                return Err(Error::package(format!(
                    "binary {} has no hex file in the archive",
                    entry.device.as_deref().unwrap_or(DEFAULT_DEVICE),
                )));
            };
            let device = entry.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string());
            if !DEVICES.contains(&device.as_str()) {
                warn!("package binary for unknown device {}", device);
            }
            binaries.push(ArduboyBinary {
                device,
                title: entry.title,
                hex: archive.read_text(&hex_name)?,
                data: archive.read_optional(entry.flashdata.as_deref())?.unwrap_or_default(),
                save: archive.read_optional(entry.flashsave.as_deref())?.unwrap_or_default(),
                cart_image: archive.read_optional(entry.cartimage.as_deref())?,
            });
        }

        if binaries.is_empty() {
            binaries.push(read_legacy(&mut archive)?);
        }

        let contributors = manifest.take_contributors();
        Ok(Self {
            title: manifest.title,
            version: manifest.version,
            author: manifest.author,
            description: manifest.description,
            genre: manifest.genre,
            date: manifest.date,
            url: manifest.url,
            source_url: manifest.source_url,
            email: manifest.email,
            publisher: manifest.publisher,
            companion: manifest.companion,
            contributors,
            binaries,
        })
    }

    pub fn to_zip_bytes(&self) -> Result<Vec<u8>> {
        let zip_err = |e: zip::result::ZipError| Error::package(format!("writing archive: {}", e));
        let io_err = |e: std::io::Error| Error::package(format!("writing archive: {}", e));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

        let mut entries = Vec::new();
        for (i, binary) in self.binaries.iter().enumerate() {
            let stem = self.file_stem(i);
            let mut files: Vec<(String, &[u8])> = Vec::new();
            let mut entry = ManifestBinary {
                title: binary.title.clone(),
                device: Some(binary.device.clone()),
                filename: Some(format!("{}.hex", stem)),
                ..ManifestBinary::default()
            };
            files.push((format!("{}.hex", stem), binary.hex.as_bytes()));
            if !binary.data.is_empty() {
                let name = format!("{}-fxdata.bin", stem);
                entry.flashdata = Some(name.clone());
                files.push((name, &binary.data[..]));
            }
            if !binary.save.is_empty() {
                let name = format!("{}-fxsave.bin", stem);
                entry.flashsave = Some(name.clone());
                files.push((name, &binary.save[..]));
            }
            if let Some(png) = &binary.cart_image {
                let name = format!("{}-title.png", stem);
                entry.cartimage = Some(name.clone());
                files.push((name, &png[..]));
            }
            for (name, bytes) in files {
                zip.start_file(name, options).map_err(zip_err)?;
                zip.write_all(bytes).map_err(io_err)?;
            }
            entries.push(entry);
        }

        let manifest = Manifest {
            schema_version: Some(SCHEMA_VERSION.into()),
            title: self.title.clone(),
            version: self.version.clone(),
            author: self.author.clone(),
            description: self.description.clone(),
            genre: self.genre.clone(),
            date: self.date.clone(),
            url: self.url.clone(),
            source_url: self.source_url.clone(),
            email: self.email.clone(),
            publisher: self.publisher.clone(),
            companion: self.companion.clone(),
            contributors: self.contributors.clone(),
            binaries: entries,
            ..Manifest::default()
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| Error::package(format!("encoding {}: {}", MANIFEST, e)))?;
        zip.start_file(MANIFEST, options).map_err(zip_err)?;
        zip.write_all(&json).map_err(io_err)?;

        Ok(zip.finish().map_err(zip_err)?.into_inner())
    }

    /// Writes the package to `path`, replacing it only once the new archive
    /// is complete.
    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = self.to_zip_bytes()?;
        let label = path.display().to_string();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| Error::io("create package", &label, e))?;
        tmp.write_all(&bytes)
            .map_err(|e| Error::io("write package", &label, e))?;
        tmp.persist(path)
            .map_err(|e| Error::io("replace package", &label, e.error))?;
        debug!("wrote {} byte package {}", bytes.len(), label);
        Ok(())
    }

    /// Archive file names for binary `index`: the device name, with the index
    /// added if another binary targets the same device.
    fn file_stem(&self, index: usize) -> String {
        let device = &self.binaries[index].device;
        let shared = self.binaries.iter().filter(|b| &b.device == device).count() > 1;
        if shared {
            format!("{}-{}", device, index)
        } else {
            device.clone()
        }
    }

    /// The binary for `device`, or the first one if there is none.
    pub fn binary_for(&self, device: &str) -> Option<&ArduboyBinary> {
        self.binaries.iter()
            .find(|b| b.device == device)
            .or_else(|| self.binaries.first())
    }

    /// Packages a flashcart program slot for `device`.
    pub fn from_slot(slot: &Slot, device: &str) -> Result<Self> {
        if slot.is_category() {
            return Err(Error::package(format!(
                "'{}' is a category, not a program",
                slot.meta.title,
            )));
        }
        let analysis = sketch::analyze(&slot.program);
        let cart_image = if slot.has_image() {
            Some(title::raw_to_png(&slot.image)?)
        } else {
            None
        };
        let meta = &slot.meta;
        let nonempty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Ok(Self {
            title: nonempty(&meta.title),
            version: nonempty(&meta.version),
            author: nonempty(&meta.developer),
            description: nonempty(&meta.info),
            binaries: vec![ArduboyBinary {
                device: device.to_string(),
                title: nonempty(&meta.title),
                hex: hex::encode(&analysis.trimmed)?,
                data: slot.data.clone(),
                save: slot.save.clone(),
                cart_image,
            }],
            ..Self::default()
        })
    }

    /// Builds a flashcart slot from binary `index`.
    pub fn to_slot(&self, index: usize) -> Result<Slot> {
        let binary = self.binaries.get(index).ok_or_else(|| Error::package(format!(
            "package has {} binaries, no binary {}",
            self.binaries.len(),
            index,
        )))?;
        let decoded = hex::decode(&binary.hex)?;
        let program = sketch::analyze_hex(&decoded).trimmed;
        if program.is_empty() {
            return Err(Error::package(format!(
                "binary {} ({}) has no program data",
                index, binary.device,
            )));
        }

        let image = match &binary.cart_image {
            Some(png) => title::image_to_raw(png).unwrap_or_else(|e| {
                warn!("ignoring unusable title image: {}", e);
                title::blank()
            }),
            None => title::blank(),
        };

        Ok(Slot {
            category: 0,
            image,
            program,
            data: binary.data.clone(),
            save: binary.save.clone(),
            meta: SlotMeta {
                title: self.title.clone().or_else(|| binary.title.clone()).unwrap_or_default(),
                version: self.version.clone().unwrap_or_default(),
                developer: self.author.clone().unwrap_or_default(),
                info: self.description.clone().unwrap_or_default(),
            },
        })
    }
}

fn read_legacy<R: Read + std::io::Seek>(archive: &mut Archive<R>) -> Result<ArduboyBinary> {
    let hex_name = archive.find_suffix(".hex")
        .ok_or_else(|| Error::package("archive contains no .hex file"))?;
    let image_name = archive.find(LEGACY_TITLE).or_else(|| {
        archive.names.iter()
            .find(|n| {
                let lower = n.to_ascii_lowercase();
                lower.ends_with(".png") && lower != BANNER
            })
            .cloned()
    });
    Ok(ArduboyBinary {
        device: DEFAULT_DEVICE.to_string(),
        title: None,
        hex: archive.read_text(&hex_name)?,
        data: match archive.find(LEGACY_DATA) {
            Some(name) => archive.read(&name)?,
            None => Vec::new(),
        },
        save: match archive.find(LEGACY_SAVE) {
            Some(name) => archive.read(&name)?,
            None => Vec::new(),
        },
        cart_image: match image_name {
            Some(name) => Some(archive.read(&name)?),
            None => None,
        },
    })
}
