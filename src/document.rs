use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

static REVISION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+-[0-9a-f]+$").unwrap());

/// A document stored in the database.
///
/// Implementors serialize their id and revision as `_id` and `_rev`.
pub trait CouchDocument: serde::Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn rev(&self) -> Option<&str>;
    /// Copy stamped with the id and revision assigned by the server.
    fn with_id_rev(self, id: Option<String>, rev: String) -> Self;
}

/// Checks the `<counter>-<lowercase hex>` shape of a revision token.
pub fn is_valid_revision(rev: &str) -> bool {
    REVISION.is_match(rev)
}

pub(crate) fn require_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::invalid_argument("Id cannot be blank"));
    }
    Ok(())
}

pub(crate) fn require_rev(rev: Option<&str>) -> Result<&str> {
    match rev {
        Some(rev) if !rev.trim().is_empty() => Ok(rev),
        Some(_) => Err(Error::invalid_argument("rev cannot be blank")),
        None => Err(Error::invalid_argument("rev cannot be null")),
    }
}

pub(crate) fn require_valid_rev(rev: Option<&str>) -> Result<&str> {
    let rev = require_rev(rev)?;
    if !is_valid_revision(rev) {
        return Err(Error::invalid_argument(format!("Invalid rev format: {}", rev)));
    }
    Ok(rev)
}

/// Flags of single document reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentOption {
    Attachments,
    AttEncodingInfo,
    Conflicts,
    DeletedConflicts,
    LocalSeq,
    Meta,
    Revs,
    RevsInfo,
}

impl DocumentOption {
    pub fn param_name(&self) -> &'static str {
        match self {
            DocumentOption::Attachments => "attachments",
            DocumentOption::AttEncodingInfo => "att_encoding_info",
            DocumentOption::Conflicts => "conflicts",
            DocumentOption::DeletedConflicts => "deleted_conflicts",
            DocumentOption::LocalSeq => "local_seq",
            DocumentOption::Meta => "meta",
            DocumentOption::Revs => "revs",
            DocumentOption::RevsInfo => "revs_info",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub map: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
}

impl View {
    pub fn new(map: impl Into<String>) -> Self {
        Self {
            map: map.into(),
            reduce: None,
        }
    }

    pub fn with_reduce(map: impl Into<String>, reduce: impl Into<String>) -> Self {
        Self {
            map: map.into(),
            reduce: Some(reduce.into()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DesignDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub views: BTreeMap<String, View>,
    /// Anything else (lists, shows, filters...) is kept untouched.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

fn default_language() -> String {
    "javascript".to_string()
}

impl DesignDocument {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            language: default_language(),
            views: BTreeMap::new(),
            other: Map::new(),
        }
    }

    /// Adds `views`, replacing existing definitions only when `overwrite` is
    /// set. Returns whether the document changed.
    pub fn merge_views(&mut self, views: BTreeMap<String, View>, overwrite: bool) -> bool {
        let mut changed = false;
        for (name, view) in views {
            match self.views.get(&name) {
                Some(existing) if existing == &view || !overwrite => {}
                _ => {
                    self.views.insert(name, view);
                    changed = true;
                }
            }
        }
        changed
    }
}

impl CouchDocument for DesignDocument {
    fn id(&self) -> &str {
        &self.id
    }

    fn rev(&self) -> Option<&str> {
        self.rev.as_deref()
    }

    fn with_id_rev(self, id: Option<String>, rev: String) -> Self {
        Self {
            id: id.unwrap_or(self.id),
            rev: Some(rev),
            ..self
        }
    }
}

/// A view declared by a repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewDefinition {
    pub name: String,
    pub map: String,
    pub reduce: Option<String>,
    /// Stores the view in `<base>-<partition>` instead of `<base>`.
    pub secondary_partition: Option<String>,
    /// Obsolete views are left out of generated design documents.
    pub obsolete: bool,
}

impl ViewDefinition {
    pub fn new(name: impl Into<String>, map: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            map: map.into(),
            ..Self::default()
        }
    }

    pub fn reduce(mut self, reduce: impl Into<String>) -> Self {
        self.reduce = Some(reduce.into());
        self
    }

    pub fn secondary_partition(mut self, partition: impl Into<String>) -> Self {
        self.secondary_partition = Some(partition.into());
        self
    }

    pub fn obsolete(mut self, obsolete: bool) -> Self {
        self.obsolete = obsolete;
        self
    }

    pub fn full_name(&self, base_id: &str) -> String {
        match self.secondary_partition.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(partition) => format!("{}-{}/{}", base_id, partition, self.name),
            None => format!("{}/{}", base_id, self.name),
        }
    }
}

/// Something that declares views.
pub trait ViewSource {
    fn view_definitions(&self) -> Vec<ViewDefinition>;
}

impl ViewSource for Vec<ViewDefinition> {
    fn view_definitions(&self) -> Vec<ViewDefinition> {
        self.clone()
    }
}

/// Produces `<design doc name>/<view name>` → [`View`] maps.
pub trait ViewGenerator<S: ?Sized> {
    fn generate_views(&self, source: &S, base_id: &str) -> BTreeMap<String, View>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleViewGenerator;

impl<S: ViewSource + ?Sized> ViewGenerator<S> for SimpleViewGenerator {
    fn generate_views(&self, source: &S, base_id: &str) -> BTreeMap<String, View> {
        source
            .view_definitions()
            .into_iter()
            .filter(|definition| !definition.obsolete)
            .map(|definition| {
                let view = View {
                    map: definition.map.clone(),
                    reduce: definition.reduce.clone().filter(|r| !r.is_empty()),
                };
                (definition.full_name(base_id), view)
            })
            .collect()
    }
}

/// Groups fully qualified view names by design document id.
pub(crate) fn group_by_design_document(
    views: BTreeMap<String, View>,
) -> BTreeMap<String, BTreeMap<String, View>> {
    let mut grouped: BTreeMap<String, BTreeMap<String, View>> = BTreeMap::new();
    for (full_name, view) in views {
        let (doc, name) = full_name
            .rsplit_once('/')
            .map(|(doc, name)| (doc.to_string(), name.to_string()))
            .unwrap_or_else(|| (full_name.clone(), full_name.clone()));
        let doc_id = if doc.starts_with("_design/") {
            doc
        } else {
            format!("_design/{}", doc)
        };
        grouped.entry(doc_id).or_default().insert(name, view);
    }
    grouped
}
