//! Helpers for extracting values from KDL nodes.

use kdl::{KdlNode, KdlValue};

use crate::{ConfigError, ConfigResult};

pub(crate) fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// Collect a property that may be repeated (`needs="a" needs="b"`) or
/// given as a child node (`needs "a" "b"`).
pub(crate) fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let result: Vec<String> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect();

    if !result.is_empty() {
        return result;
    }

    node.children()
        .and_then(|children| children.nodes().iter().find(|c| c.name().value() == name))
        .map(get_all_string_args)
        .unwrap_or_default()
}

pub(crate) fn require_string_arg(node: &KdlNode) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::InvalidValue {
        field: node.name().value().to_string(),
        message: "expected a string".to_string(),
    })
}

pub(crate) fn require_u64_arg(node: &KdlNode) -> ConfigResult<u64> {
    first_arg(node)
        .and_then(|v| v.as_integer())
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: node.name().value().to_string(),
            message: "expected a non-negative integer".to_string(),
        })
}

pub(crate) fn require_bool_arg(node: &KdlNode) -> ConfigResult<bool> {
    first_arg(node)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: node.name().value().to_string(),
            message: "expected #true or #false".to_string(),
        })
}
