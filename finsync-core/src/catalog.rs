//! Field name ↔ human label ↔ owning series, built lazily from plugin probes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard};

use tracing::{debug, warn};

use crate::plugin::PluginInfo;

/// Group key for fields no plugin declares.
pub const UNKNOWN_URI: &str = "<unknown>";

#[derive(Debug, Default)]
struct CatalogMaps {
    field_to_uri: HashMap<String, String>,
    field_to_label: HashMap<String, String>,
    label_to_field: HashMap<String, String>,
}

impl CatalogMaps {
    fn build(probes: &[PluginInfo]) -> Self {
        let mut maps = CatalogMaps::default();
        for info in probes {
            for (uri, fields) in &info.fields {
                for (field, label) in fields {
                    if let Some(owner) = maps.field_to_uri.get(field) {
                        warn!(
                            field = %field,
                            owner = %owner,
                            redeclared_by = %uri,
                            "field declared twice, keeping the first"
                        );
                        continue;
                    }
                    maps.field_to_uri.insert(field.clone(), uri.clone());
                    maps.field_to_label.insert(field.clone(), label.clone());
                    maps.label_to_field
                        .entry(label.clone())
                        .or_insert_with(|| field.clone());
                }
            }
        }
        debug!(fields = maps.field_to_uri.len(), "built field catalog");
        maps
    }
}

/// Lookup tables are built on first use and rebuilt wholesale by
/// [`FieldCatalog::refresh`].
#[derive(Debug, Default)]
pub struct FieldCatalog {
    probes: RwLock<Vec<PluginInfo>>,
    maps: RwLock<Option<CatalogMaps>>,
}

impl FieldCatalog {
    pub fn new(probes: Vec<PluginInfo>) -> Self {
        Self {
            probes: RwLock::new(probes),
            maps: RwLock::new(None),
        }
    }

    /// Replace the plugin metadata and drop the built maps.
    pub fn refresh(&self, probes: Vec<PluginInfo>) {
        *self.probes.write().unwrap_or_else(|e| e.into_inner()) = probes;
        *self.maps.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn maps(&self) -> RwLockReadGuard<'_, Option<CatalogMaps>> {
        {
            let maps = self.maps.read().unwrap_or_else(|e| e.into_inner());
            if maps.is_some() {
                return maps;
            }
        }
        {
            let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
            if maps.is_none() {
                let probes = self.probes.read().unwrap_or_else(|e| e.into_inner());
                *maps = Some(CatalogMaps::build(&probes));
            }
        }
        self.maps.read().unwrap_or_else(|e| e.into_inner())
    }

    fn with_maps<T>(&self, f: impl FnOnce(&CatalogMaps) -> T) -> T {
        let guard = self.maps();
        match guard.as_ref() {
            Some(maps) => f(maps),
            None => f(&CatalogMaps::default()),
        }
    }

    pub fn field_to_uri(&self, field: &str) -> Option<String> {
        self.with_maps(|m| m.field_to_uri.get(field).cloned())
    }

    pub fn field_to_label(&self, field: &str) -> Option<String> {
        self.with_maps(|m| m.field_to_label.get(field).cloned())
    }

    pub fn label_to_field(&self, label: &str) -> Option<String> {
        self.with_maps(|m| m.label_to_field.get(label).cloned())
    }

    /// Translate labels to internal names; names that are not labels pass
    /// through untouched.
    pub fn to_fields(&self, names: &[String]) -> Vec<String> {
        self.with_maps(|m| {
            names
                .iter()
                .map(|n| m.label_to_field.get(n).cloned().unwrap_or_else(|| n.clone()))
                .collect()
        })
    }

    /// `field -> label` for every field in `fields` that has a label.
    pub fn labels_for(&self, fields: &[String]) -> HashMap<String, String> {
        self.with_maps(|m| {
            fields
                .iter()
                .filter_map(|f| m.field_to_label.get(f).map(|l| (f.clone(), l.clone())))
                .collect()
        })
    }

    /// Group fields by owning series; unowned fields land under
    /// [`UNKNOWN_URI`].
    pub fn fields_to_uri(&self, fields: &[String]) -> BTreeMap<String, Vec<String>> {
        self.with_maps(|m| {
            let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for field in fields {
                let uri = m
                    .field_to_uri
                    .get(field)
                    .map(String::as_str)
                    .unwrap_or(UNKNOWN_URI);
                let bucket = grouped.entry(uri.to_string()).or_default();
                if !bucket.contains(field) {
                    bucket.push(field.clone());
                }
            }
            grouped
        })
    }

    /// Every declared field of one series, sorted.
    pub fn fields_of(&self, uri: &str) -> Vec<String> {
        self.with_maps(|m| {
            let mut fields: Vec<String> = m
                .field_to_uri
                .iter()
                .filter(|(_, u)| u.eq_ignore_ascii_case(uri))
                .map(|(f, _)| f.clone())
                .collect();
            fields.sort();
            fields
        })
    }

    pub fn len(&self) -> usize {
        self.with_maps(|m| m.field_to_uri.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
