// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Matching flashcart contents against the online game catalog.

use std::cmp::Ordering;

use base64::Engine;
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::cart::Slot;
use crate::error::{Error, Result};
use crate::package::DEFAULT_DEVICE;
use crate::title;

/// Download locations for one device's build of a catalog game.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogProgram {
    pub hex: Option<String>,
    pub data: Option<String>,
    pub save: Option<String>,
}

/// A catalog game, reduced to what matching needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: Option<String>,
    pub title: String,
    pub developer: String,
    pub version: String,
    pub info: String,
    pub program: CatalogProgram,
    /// Raw title screen, blank if the catalog's image was unusable.
    pub image: Vec<u8>,
}

/// How a cart compares with the catalog. Slots are referred to by index.
#[derive(Clone, Debug, Default)]
pub struct UpdatePlan {
    /// Slots with a newer catalog version.
    pub updates: Vec<(usize, CatalogEntry)>,
    /// Slots that are up to date.
    pub current: Vec<(usize, CatalogEntry)>,
    /// Program slots the catalog doesn't know.
    pub unmatched: Vec<usize>,
    /// Catalog games not on the cart.
    pub new: Vec<CatalogEntry>,
}

/// Scalar JSON values as text; the catalog isn't consistent about quoting
/// numbers.
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parses the catalog, keeping the build for `device` (or the default
/// device) of each game.
///
/// Entries missing a title, developer or version, or with no usable build,
/// are dropped. So are repeated IDs after the first.
pub fn parse_catalog(json: &str, device: &str) -> Result<Vec<CatalogEntry>> {
    let list: Vec<Value> = serde_json::from_str(json)
        .map_err(|e| Error::format(format!("catalog is not a JSON list: {}", e)))?;

    let mut seen = Vec::new();
    let mut entries = Vec::new();
    for item in &list {
        let Some(obj) = item.as_object() else {
            continue;
        };
        let id = text(obj.get("ID"));
        if let Some(id) = &id {
            if seen.contains(id) {
                continue;
            }
        }
        let (Some(title), Some(developer), Some(version)) = (
            text(obj.get("title")),
            text(obj.get("developer")),
            text(obj.get("version")),
        ) else {
            continue;
        };
        if let Some(id) = &id {
            seen.push(id.clone());
        }

        let programs = obj.get("program").and_then(Value::as_object);
        let Some(program) = programs
            .and_then(|p| p.get(device).or_else(|| p.get(DEFAULT_DEVICE)))
            .and_then(Value::as_object)
        else {
            debug!("catalog entry '{}' has no build for {}", title, device);
            continue;
        };

        let image = decode_image(program).unwrap_or_else(|e| {
            error!(
                "couldn't decode catalog image for '{}' [{}]: {}",
                title, id.as_deref().unwrap_or("?"), e,
            );
            title::blank()
        });

        entries.push(CatalogEntry {
            id,
            info: text(obj.get("info")).unwrap_or_default(),
            program: CatalogProgram {
                hex: text(program.get("hex")),
                data: text(program.get("fxdata")).or_else(|| text(program.get("data"))),
                save: text(program.get("fxsave")).or_else(|| text(program.get("save"))),
            },
            title,
            developer,
            version,
            image,
        });
    }
    debug!("{} of {} catalog entries usable", entries.len(), list.len());
    Ok(entries)
}

fn decode_image(program: &Map<String, Value>) -> Result<Vec<u8>> {
    let encoded = text(program.get("image64"))
        .ok_or_else(|| Error::image("no image64 field"))?;
    let png = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::image(format!("bad base64: {}", e)))?;
    title::image_to_raw(&png)
}

fn version_numbers(v: Option<&str>) -> Vec<u64> {
    v.unwrap_or("")
        .split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
        .map(|run| run.parse().unwrap_or(u64::MAX))
        .collect()
}

/// Whether version `a` is newer than `b`, comparing the runs of digits in
/// each. When one is a prefix of the other, the longer one is newer.
pub fn version_greater(a: Option<&str>, b: Option<&str>) -> bool {
    let (a, b) = (version_numbers(a), version_numbers(b));
    // Vec ordering is lexicographic with prefixes sorting first.
    a.cmp(&b) == Ordering::Greater
}

fn optional(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

/// Sorts the program slots of a cart into updatable, current and unknown,
/// first by title and developer and then by identical title screens.
pub fn compute_update(slots: &[Slot], catalog: Vec<CatalogEntry>) -> UpdatePlan {
    let mut plan = UpdatePlan::default();
    let mut remaining = catalog;
    let mut unmatched: Vec<usize> = slots.iter()
        .enumerate()
        .filter(|(_, s)| !s.is_category())
        .map(|(i, _)| i)
        .collect();

    let classify = |plan: &mut UpdatePlan, index: usize, entry: CatalogEntry| {
        let local = optional(&slots[index].meta.version);
        if version_greater(Some(&entry.version), local) {
            plan.updates.push((index, entry));
        } else {
            plan.current.push((index, entry));
        }
    };

    unmatched.retain(|&i| {
        let meta = &slots[i].meta;
        if meta.title.is_empty() || meta.developer.is_empty() {
            return true;
        }
        let found = remaining.iter().position(|e| {
            e.title.to_lowercase() == meta.title.to_lowercase()
                && e.developer.to_lowercase() == meta.developer.to_lowercase()
        });
        match found {
            Some(pos) => {
                classify(&mut plan, i, remaining.remove(pos));
                false
            }
            None => true,
        }
    });

    unmatched.retain(|&i| {
        match remaining.iter().position(|e| e.image == slots[i].image) {
            Some(pos) => {
                classify(&mut plan, i, remaining.remove(pos));
                false
            }
            None => true,
        }
    });

    plan.unmatched = unmatched;
    plan.new = remaining;
    plan
}
