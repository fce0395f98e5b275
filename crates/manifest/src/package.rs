use std::path::PathBuf;
use std::sync::Arc;

use wireit_protocol::{Location, Range};

use crate::ast::{parse_json, JsonNode, ParseError};

/// One entry of the `scripts` section.
#[derive(Debug, Clone)]
pub struct ScriptEntry<'a> {
    pub name: &'a str,
    pub name_range: Range,
    pub command: Option<&'a str>,
    pub value_range: Range,
}

/// A parsed `package.json`, holding the raw text, the span-tracked tree, and
/// enough context to mint [`Location`]s for diagnostics.
#[derive(Debug)]
pub struct PackageJson {
    path: Arc<PathBuf>,
    contents: Arc<str>,
    root: JsonNode,
}

impl PackageJson {
    pub fn parse(path: PathBuf, contents: String) -> Result<Self, ParseError> {
        let root = parse_json(&contents)?;
        Ok(Self {
            path: Arc::new(path),
            contents: Arc::from(contents),
            root,
        })
    }

    pub fn path(&self) -> &Arc<PathBuf> {
        &self.path
    }

    pub fn contents(&self) -> &Arc<str> {
        &self.contents
    }

    pub fn root(&self) -> &JsonNode {
        &self.root
    }

    /// Mint a location inside this file.
    pub fn location(&self, range: Range) -> Location {
        Location::new(self.path.clone(), self.contents.clone(), range)
    }

    /// Location of the whole document, for file-level diagnostics.
    pub fn file_location(&self) -> Location {
        self.location(Range::new(0, 0))
    }

    /// The `scripts` object node, if present and an object.
    pub fn scripts_node(&self) -> Option<&JsonNode> {
        self.root.get("scripts")
    }

    /// Iterate the `scripts` section. Non-string command values surface with
    /// `command: None` so the caller can report them precisely.
    pub fn scripts(&self) -> Vec<ScriptEntry<'_>> {
        let Some(scripts) = self.scripts_node().and_then(|node| node.as_object()) else {
            return Vec::new();
        };
        scripts
            .iter()
            .map(|member| ScriptEntry {
                name: &member.key,
                name_range: member.key_range,
                command: member.value.as_str(),
                value_range: member.value.range,
            })
            .collect()
    }

    /// Look up one script by name.
    pub fn script(&self, name: &str) -> Option<ScriptEntry<'_>> {
        let member = self.scripts_node()?.member(name)?;
        Some(ScriptEntry {
            name: &member.key,
            name_range: member.key_range,
            command: member.value.as_str(),
            value_range: member.value.range,
        })
    }

    /// The `wireit` section node, if present.
    pub fn wireit_node(&self) -> Option<&JsonNode> {
        self.root.get("wireit")
    }

    /// The wireit config object for one script, with the key's span.
    pub fn wireit_config(&self, name: &str) -> Option<(&JsonNode, Range)> {
        let member = self.wireit_node()?.member(name)?;
        Some((&member.value, member.key_range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(contents: &str) -> PackageJson {
        PackageJson::parse(PathBuf::from("/pkg/package.json"), contents.to_string()).unwrap()
    }

    #[test]
    fn scripts_are_enumerated_in_order() {
        let manifest = pkg(r#"{"scripts": {"build": "wireit", "test": "wireit"}}"#);
        let scripts = manifest.scripts();
        assert_eq!(scripts.len(), 2);
        assert_eq!(scripts[0].name, "build");
        assert_eq!(scripts[0].command, Some("wireit"));
        assert_eq!(scripts[1].name, "test");
    }

    #[test]
    fn non_string_script_value_has_no_command() {
        let manifest = pkg(r#"{"scripts": {"build": 42}}"#);
        let entry = manifest.script("build").unwrap();
        assert_eq!(entry.command, None);
    }

    #[test]
    fn wireit_config_lookup_returns_key_span() {
        let contents = r#"{"wireit": {"build": {"command": "tsc"}}}"#;
        let manifest = pkg(contents);
        let (node, key_range) = manifest.wireit_config("build").unwrap();
        assert_eq!(
            &contents[key_range.offset..key_range.offset + key_range.length],
            "\"build\""
        );
        assert_eq!(node.get("command").and_then(|n| n.as_str()), Some("tsc"));
    }

    #[test]
    fn missing_sections_are_none() {
        let manifest = pkg("{}");
        assert!(manifest.scripts_node().is_none());
        assert!(manifest.wireit_node().is_none());
        assert!(manifest.script("build").is_none());
    }

    #[test]
    fn locations_carry_file_identity() {
        let manifest = pkg(r#"{"scripts": {}}"#);
        let loc = manifest.file_location();
        assert_eq!(loc.path.as_path(), std::path::Path::new("/pkg/package.json"));
        assert_eq!(loc.line_col(), (1, 1));
    }
}
