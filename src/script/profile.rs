//! Customization profile documents.
//!
//! ```text
//! {
//!   "registry":  [{"modtype": "add", "key": "...", "name": "...", "value": "...", "valuetype": "String"}],
//!   "directory": [{"modtype": "add", "dirpath": "C:\\mlbxs"}],
//!   "document":  [{"modtype": "add", "docpath": "C:\\mlbxs\\readme.txt"}],
//!   "package":   [{"package": "thunderbird"}]
//! }
//! ```
//!
//! Operations are flattened in the order registry, directory, document,
//! package. Keys other than these four are ignored.

use serde::Deserialize;
use serde_json::Value;

use super::{ModType, Operation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    name: String,
    operations: Vec<Operation>,
}

#[derive(Debug, Default, Deserialize)]
struct Document {
    #[serde(default)]
    registry: Vec<RegistryEntry>,
    #[serde(default)]
    directory: Vec<DirectoryEntry>,
    #[serde(default)]
    document: Vec<DocumentEntry>,
    #[serde(default)]
    package: Vec<PackageEntry>,
}

#[derive(Debug, Deserialize)]
struct RegistryEntry {
    modtype: String,
    key: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    valuetype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    modtype: String,
    dirpath: String,
}

#[derive(Debug, Deserialize)]
struct DocumentEntry {
    modtype: String,
    docpath: String,
}

#[derive(Debug, Deserialize)]
struct PackageEntry {
    package: String,
}

impl Profile {
    pub fn new(name: impl Into<String>, operations: Vec<Operation>) -> Self {
        Self {
            name: name.into(),
            operations,
        }
    }

    /// Parse a profile from strict JSON (comments already stripped).
    pub fn from_json(name: &str, text: &str) -> Result<Self, serde_json::Error> {
        let doc: Document = serde_json::from_str(text)?;

        let registry = doc.registry.into_iter().map(|e| Operation::RegistryEdit {
            modtype: ModType::parse(&e.modtype),
            key: e.key,
            name: e.name,
            // Numeric DWORD values are common in hand-written profiles.
            value: e.value.map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            }),
            valuetype: e.valuetype,
        });
        let directory = doc.directory.into_iter().map(|e| Operation::DirectoryOp {
            modtype: ModType::parse(&e.modtype),
            path: e.dirpath,
        });
        let document = doc.document.into_iter().map(|e| Operation::DocumentOp {
            modtype: ModType::parse(&e.modtype),
            path: e.docpath,
        });
        let package = doc
            .package
            .into_iter()
            .map(|e| Operation::PackageInstall { name: e.package });

        Ok(Self {
            name: name.to_string(),
            operations: registry.chain(directory).chain(document).chain(package).collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Cache artifact the compiled profile is written to during a build.
    pub fn script_name(&self) -> String {
        format!("profile-{}.ps1", self.name)
    }
}
