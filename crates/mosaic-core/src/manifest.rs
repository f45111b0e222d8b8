use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bundlers key chunks by number or by name depending on configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkIdent {
    Number(u64),
    Name(String),
}

impl std::fmt::Display for ChunkIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(s) => f.write_str(s),
        }
    }
}

/// The JSON sidecar emitted next to every rewritten chunk.
///
/// `modules` maps each define path in the chunk to the require paths its
/// body issues. `entry` is present only on entry chunks and names the define
/// path the host bootstraps from. Consumers tolerate unknown fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    pub hash: String,
    pub id: ChunkIdent,
    pub name: String,
    pub files: Vec<String>,
    pub modules: BTreeMap<String, Vec<String>>,
}

impl ChunkManifest {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Manifests live next to the chunk asset they describe.
pub fn manifest_file_name(chunk_file: &str) -> String {
    format!("{chunk_file}.manifest")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChunkManifest {
        let mut modules = BTreeMap::new();
        modules.insert(
            "acme@1.4.2/lib/m.js".to_string(),
            vec!["utils@^3.0.0/lib/index.js".to_string()],
        );
        ChunkManifest {
            entry: Some("acme@1.4.2/lib/m.js".to_string()),
            hash: "5d41402abc".to_string(),
            id: ChunkIdent::Number(0),
            name: "main".to_string(),
            files: vec!["main.bundle.js".to_string()],
            modules,
        }
    }

    #[test]
    fn json_round_trip() {
        let manifest = sample();
        let text = manifest.to_json().unwrap();
        assert_eq!(ChunkManifest::from_json(&text).unwrap(), manifest);
    }

    #[test]
    fn entry_is_omitted_when_absent() {
        let mut manifest = sample();
        manifest.entry = None;
        let text = manifest.to_json().unwrap();
        assert!(!text.contains("entry"));
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let text = r#"{
            "hash": "abc",
            "id": "vendors",
            "name": "vendors",
            "files": ["vendors.js"],
            "modules": {},
            "integrity": "sha384-..."
        }"#;
        let manifest = ChunkManifest::from_json(text).unwrap();
        assert_eq!(manifest.id, ChunkIdent::Name("vendors".to_string()));
        assert_eq!(manifest.entry, None);
    }

    #[test]
    fn manifest_name_is_the_chunk_file_plus_suffix() {
        assert_eq!(manifest_file_name("main.bundle.js"), "main.bundle.js.manifest");
    }
}
