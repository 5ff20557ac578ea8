//! Map upstream tool names onto whatever the client advertised.

use std::collections::HashSet;

use serde_json::Value as JsonValue;

/// One client-advertised tool: name plus the property keys of its input
/// schema, used as a last-resort similarity signal.
#[derive(Debug, Clone)]
pub struct ClientTool {
    pub name: String,
    pub properties: HashSet<String>,
}

impl ClientTool {
    pub fn from_schema(name: impl Into<String>, input_schema: &JsonValue) -> Self {
        let properties = input_schema
            .get("properties")
            .and_then(JsonValue::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default();
        Self {
            name: name.into(),
            properties,
        }
    }
}

/// Fixed alias pairs; both directions are consulted.
const ALIASES: &[(&str, &[&str])] = &[
    ("ripgrep", &["grep", "search", "search_files"]),
    ("grep", &["ripgrep"]),
    ("write", &["create_file", "write_file"]),
    ("create_file", &["write", "write_file"]),
    ("run_command", &["bash", "execute_command", "shell"]),
    ("bash", &["run_command", "execute_command"]),
    ("str_replace_editor", &["edit", "edit_file"]),
    ("edit", &["str_replace_editor", "edit_file"]),
    ("read", &["read_file", "view"]),
    ("ls", &["list", "list_files", "list_directory"]),
    ("glob", &["find", "find_files"]),
];

pub struct ToolNameMapper {
    tools: Vec<ClientTool>,
}

impl ToolNameMapper {
    pub fn new(tools: Vec<ClientTool>) -> Self {
        Self { tools }
    }

    pub fn empty() -> Self {
        Self { tools: Vec::new() }
    }

    /// Resolve an upstream tool name to a client tool name.
    ///
    /// Chain: exact -> case-insensitive -> last dotted segment -> alias
    /// table -> input-schema property overlap -> the raw name untouched.
    pub fn resolve(&self, upstream: &str, upstream_input: Option<&JsonValue>) -> String {
        let normalized = normalize(upstream);

        if let Some(tool) = self.tools.iter().find(|tool| tool.name == upstream) {
            return tool.name.clone();
        }
        if let Some(tool) = self
            .tools
            .iter()
            .find(|tool| tool.name.eq_ignore_ascii_case(upstream))
        {
            return tool.name.clone();
        }
        if let Some(tool) = self
            .tools
            .iter()
            .find(|tool| normalize(&tool.name) == normalized)
        {
            return tool.name.clone();
        }

        for (from, to) in ALIASES {
            if *from == normalized {
                for candidate in *to {
                    if let Some(tool) = self
                        .tools
                        .iter()
                        .find(|tool| normalize(&tool.name) == *candidate)
                    {
                        return tool.name.clone();
                    }
                }
            }
        }

        if let Some(input) = upstream_input.and_then(JsonValue::as_object) {
            let keys: HashSet<String> = input.keys().cloned().collect();
            let best = self
                .tools
                .iter()
                .map(|tool| (tool, tool.properties.intersection(&keys).count()))
                .filter(|(_, overlap)| *overlap > 0)
                .max_by_key(|(_, overlap)| *overlap);
            if let Some((tool, _)) = best {
                return tool.name.clone();
            }
        }

        upstream.to_string()
    }
}

/// Lowercase, last dotted segment, dashes folded to underscores.
fn normalize(name: &str) -> String {
    name.rsplit('.')
        .next()
        .unwrap_or(name)
        .to_ascii_lowercase()
        .replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(names: &[(&str, JsonValue)]) -> ToolNameMapper {
        ToolNameMapper::new(
            names
                .iter()
                .map(|(name, schema)| ClientTool::from_schema(*name, schema))
                .collect(),
        )
    }

    #[test]
    fn exact_match_wins() {
        let m = mapper(&[("search_files", serde_json::json!({}))]);
        assert_eq!(m.resolve("search_files", None), "search_files");
    }

    #[test]
    fn dotted_prefix_is_stripped() {
        let m = mapper(&[("read_file", serde_json::json!({}))]);
        assert_eq!(m.resolve("coding_agent.read_file", None), "read_file");
    }

    #[test]
    fn alias_table_bridges_vocabularies() {
        let m = mapper(&[("grep", serde_json::json!({}))]);
        assert_eq!(m.resolve("ripgrep", None), "grep");

        let m = mapper(&[("Bash", serde_json::json!({}))]);
        assert_eq!(m.resolve("run_command", None), "Bash");
    }

    #[test]
    fn property_overlap_breaks_unknown_names() {
        let m = mapper(&[
            (
                "apply_patch",
                serde_json::json!({"properties": {"file_path": {}, "patch": {}}}),
            ),
            (
                "lookup",
                serde_json::json!({"properties": {"query": {}}}),
            ),
        ]);
        let input = serde_json::json!({"file_path": "a.rs", "patch": "x"});
        assert_eq!(m.resolve("mystery_edit", Some(&input)), "apply_patch");
    }

    #[test]
    fn unmatched_names_pass_through() {
        let m = ToolNameMapper::empty();
        assert_eq!(m.resolve("totally_new", None), "totally_new");
    }
}
