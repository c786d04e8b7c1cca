//! Resource documents.
//!
//! A resource document is the TOML inventory written by a scan of an
//! account. Only the resource ids matter for deletion, everything else
//! (`metadata`, `summary`, per-resource detail tables) is informational.
//!
//! Regional ids are read from any of:
//!
//! ```toml
//! [regions.us-east-1.ec2]
//! resource_ids = ["i-1"]
//!
//! [region_us-east-1.vpc]
//! resource_ids = ["vpc-1"]
//!
//! [regions.eu-west-1]
//! instance_ids = ["i-2"]   # EC2-only inventories
//!
//! [regions.eu-west-1.instances.i-2]
//! state = "running"
//! ```
//!
//! and global ids from `[global_s3] resource_ids = [..]`.
//!
//! The `instances.<id>` detail tables of EC2-only inventories record each
//! instance's state at scan time, see
//! [`ResourceDocument::retain_instance_states`]. Older inventories have no
//! `instance_ids` and list the instances only as detail tables, keyed or
//! carrying an `InstanceId`.
use std::collections::{BTreeMap, BTreeSet};

use snafu::prelude::*;

use crate::kind::ResourceKind;

/// Errors that make a document unusable. These are fatal to a run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LoadError {
    #[snafu(display("Could not read resource document '{path:?}': {source}"))]
    DocumentRead {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Resource document is not valid TOML: {source}"))]
    DocumentParse { source: toml::de::Error },

    #[snafu(display("Malformed resource document at '{key}': {msg}"))]
    Malformed { key: String, msg: String },
}

/// Ids of each kind within one region, or within the global section.
pub type Section = BTreeMap<ResourceKind, Vec<String>>;

/// Scan metadata. Informational only.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub scan_date: Option<String>,
    pub profile: Option<String>,
    pub total_regions_scanned: Option<u64>,
    pub regions_scanned: Vec<String>,
    pub resource_types_scanned: Vec<String>,
}

/// The scanner's own counts. Informational only.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct Summary {
    pub total_resources: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_region: BTreeMap<String, u64>,
    /// Written by EC2-only inventories instead of `total_resources`.
    pub total_instances: Option<u64>,
    pub by_state: BTreeMap<String, u64>,
}

/// An inventory of resources to delete.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceDocument {
    pub regions: BTreeMap<String, Section>,
    pub global: Option<Section>,
    pub metadata: Option<Metadata>,
    pub summary: Option<Summary>,
    /// Instance id to the state recorded at scan time, where one was.
    pub instance_states: BTreeMap<String, String>,
}

/// Reads `resource_ids` out of a `<kind>` table.
fn read_ids(key: &str, value: &toml::Value) -> Result<Option<Vec<String>>, LoadError> {
    let table = value
        .as_table()
        .with_context(|| MalformedSnafu {
            key,
            msg: "expected a table",
        })?;
    match table.get("resource_ids") {
        None => Ok(None),
        Some(ids) => string_array(&format!("{key}.resource_ids"), ids).map(Some),
    }
}

fn string_array(key: &str, value: &toml::Value) -> Result<Vec<String>, LoadError> {
    let array = value
        .as_array()
        .with_context(|| MalformedSnafu {
            key,
            msg: "expected an array of ids",
        })?;
    array
        .iter()
        .map(|id| {
            id.as_str()
                .map(ToOwned::to_owned)
                .with_context(|| MalformedSnafu {
                    key,
                    msg: format!("expected a string id, found {id}"),
                })
        })
        .collect()
}

fn add_ids(section: &mut Section, kind: ResourceKind, ids: Vec<String>) {
    section.entry(kind).or_default().extend(ids);
}

/// Reads the `instances` detail tables of a region, returning
/// `(id, recorded state)` pairs in table order.
fn read_instance_details(
    key: &str,
    value: &toml::Value,
) -> Result<Vec<(String, Option<String>)>, LoadError> {
    let table = value
        .as_table()
        .with_context(|| MalformedSnafu {
            key,
            msg: "expected a table of instances",
        })?;
    let field = |detail: &toml::Table, names: &[&str]| {
        names
            .iter()
            .find_map(|name| detail.get(*name).and_then(toml::Value::as_str))
            .map(ToOwned::to_owned)
    };
    Ok(table
        .iter()
        .filter_map(|(name, detail)| {
            let Some(detail) = detail.as_table() else {
                log::debug!("ignoring '{key}.{name}', not a table");
                return None;
            };
            let id = field(detail, &["InstanceId", "id"]).unwrap_or_else(|| name.clone());
            Some((id, field(detail, &["state", "State"])))
        })
        .collect())
}

/// Reads one region's table, recording instance states into `states`.
fn read_region(
    key: &str,
    value: &toml::Value,
    states: &mut BTreeMap<String, String>,
) -> Result<Section, LoadError> {
    let table = value
        .as_table()
        .with_context(|| MalformedSnafu {
            key,
            msg: "expected a table of resource types",
        })?;

    let mut section = Section::new();
    for (tag, entry) in table {
        let entry_key = format!("{key}.{tag}");
        if tag == "instance_ids" {
            add_ids(
                &mut section,
                ResourceKind::Instance,
                string_array(&entry_key, entry)?,
            );
            continue;
        }
        if tag == "instances" {
            let details = read_instance_details(&entry_key, entry)?;
            let listed = table.contains_key("instance_ids");
            let mut legacy = vec![];
            for (id, state) in details {
                if let Some(state) = state {
                    states.insert(id.clone(), state);
                }
                if !listed {
                    legacy.push(id);
                }
            }
            if !legacy.is_empty() {
                add_ids(&mut section, ResourceKind::Instance, legacy);
            }
            continue;
        }
        let kind = match tag.parse::<ResourceKind>() {
            Ok(kind) => kind,
            Err(_) if !entry.is_table() => continue,
            Err(e) => {
                log::warn!("ignoring '{entry_key}': {e}");
                continue;
            }
        };
        if kind.is_global() {
            log::warn!("ignoring '{entry_key}': {kind} are not regional");
            continue;
        }
        if let Some(ids) = read_ids(&entry_key, entry)? {
            add_ids(&mut section, kind, ids);
        }
    }
    Ok(section)
}

impl ResourceDocument {
    /// Load a document from a TOML file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        log::debug!("reading resource document {path:?}");
        let contents = std::fs::read_to_string(path).context(DocumentReadSnafu { path })?;
        Self::from_toml_str(&contents)
    }

    /// Parse a document from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, LoadError> {
        let root: toml::Table = contents.parse().context(DocumentParseSnafu)?;
        let mut doc = ResourceDocument::default();

        for (key, value) in &root {
            if key == "regions" {
                let regions = value
                    .as_table()
                    .with_context(|| MalformedSnafu {
                        key: "regions",
                        msg: "expected a table of regions",
                    })?;
                for (region, section) in regions {
                    let section = read_region(
                        &format!("regions.{region}"),
                        section,
                        &mut doc.instance_states,
                    )?;
                    doc.merge_region(region, section);
                }
            } else if let Some(region) = key.strip_prefix("region_") {
                let section = read_region(key, value, &mut doc.instance_states)?;
                doc.merge_region(region, section);
            } else if let Some(tag) = key.strip_prefix("global_") {
                let kind = match tag.parse::<ResourceKind>() {
                    Ok(kind) if kind.is_global() => kind,
                    Ok(kind) => {
                        log::warn!("ignoring '{key}': {kind} are regional");
                        continue;
                    }
                    Err(e) => {
                        log::warn!("ignoring '{key}': {e}");
                        continue;
                    }
                };
                if let Some(ids) = read_ids(key, value)? {
                    add_ids(doc.global.get_or_insert_with(Default::default), kind, ids);
                }
            } else if key == "metadata" {
                let metadata: Metadata =
                    value.clone().try_into().map_err(|e: toml::de::Error| {
                        MalformedSnafu {
                            key: "metadata",
                            msg: e.message(),
                        }
                        .build()
                    })?;
                doc.metadata = Some(metadata);
            } else if key == "summary" {
                let summary: Summary =
                    value.clone().try_into().map_err(|e: toml::de::Error| {
                        MalformedSnafu {
                            key: "summary",
                            msg: e.message(),
                        }
                        .build()
                    })?;
                doc.summary = Some(summary);
            } else {
                log::debug!("ignoring top level key '{key}'");
            }
        }

        Ok(doc)
    }

    fn merge_region(&mut self, region: &str, section: Section) {
        let entry = self.regions.entry(region.to_owned()).or_default();
        for (kind, ids) in section {
            add_ids(entry, kind, ids);
        }
    }

    /// The `(region, ids)` pairs holding ids of `kind`, regions in name order.
    ///
    /// The global section is reported with a `None` region.
    pub fn targets(&self, kind: ResourceKind) -> Vec<(Option<&str>, &[String])> {
        if kind.is_global() {
            return self
                .global
                .iter()
                .filter_map(|section| section.get(&kind))
                .filter(|ids| !ids.is_empty())
                .map(|ids| (None, ids.as_slice()))
                .collect();
        }
        self.regions
            .iter()
            .filter_map(|(region, section)| {
                section
                    .get(&kind)
                    .filter(|ids| !ids.is_empty())
                    .map(|ids| (Some(region.as_str()), ids.as_slice()))
            })
            .collect()
    }

    /// The number of ids a run restricted to `only` would attempt.
    pub fn total_ids(&self, only: Option<&BTreeSet<ResourceKind>>) -> usize {
        ResourceKind::DELETION_ORDER
            .into_iter()
            .filter(|kind| only.map_or(true, |only| only.contains(kind)))
            .flat_map(|kind| self.targets(kind))
            .map(|(_, ids)| crate::outcome::dedup_ids(ids).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_ids(None) == 0
    }

    /// Drop instance ids whose recorded state is not in `states`, returning
    /// the dropped ids.
    ///
    /// Ids without a recorded state are kept. An empty `states` keeps
    /// everything.
    pub fn retain_instance_states(&mut self, states: &BTreeSet<String>) -> Vec<String> {
        if states.is_empty() {
            return vec![];
        }
        let mut dropped = vec![];
        for (region, section) in &mut self.regions {
            let Some(ids) = section.get_mut(&ResourceKind::Instance) else {
                continue;
            };
            ids.retain(|id| match self.instance_states.get(id) {
                Some(state) if !states.contains(state) => {
                    log::info!("skipping {id} in {region}, it was {state} at scan time");
                    dropped.push(id.clone());
                    false
                }
                _ => true,
            });
        }
        dropped
    }

    /// A human readable overview of the embedded metadata and summary.
    pub fn describe(&self) -> String {
        let mut lines = vec!["Resource document:".to_owned()];
        let metadata = self.metadata.clone().unwrap_or_default();
        let summary = self.summary.clone().unwrap_or_default();
        lines.push(format!(
            "  scan date: {}",
            metadata.scan_date.as_deref().unwrap_or("unknown")
        ));
        lines.push(format!(
            "  profile: {}",
            metadata.profile.as_deref().unwrap_or("default")
        ));
        lines.push(format!(
            "  regions scanned: {}",
            metadata.total_regions_scanned.unwrap_or(0)
        ));
        if !metadata.resource_types_scanned.is_empty() {
            lines.push(format!(
                "  resource types: {}",
                metadata.resource_types_scanned.join(", ")
            ));
        }
        match summary.total_instances {
            Some(total) => {
                lines.push(format!("  total instances: {total}"));
                if !summary.by_state.is_empty() {
                    lines.push("  by state:".to_owned());
                    for (state, count) in &summary.by_state {
                        lines.push(format!("    - {state}: {count}"));
                    }
                }
            }
            None => lines.push(format!("  total resources: {}", summary.total_resources)),
        }
        if !summary.by_type.is_empty() {
            lines.push("  by type:".to_owned());
            for (tag, count) in &summary.by_type {
                lines.push(format!("    - {tag}: {count}"));
            }
        }
        lines.push(format!("  ids listed for deletion: {}", self.total_ids(None)));
        lines.join("\n")
    }
}
