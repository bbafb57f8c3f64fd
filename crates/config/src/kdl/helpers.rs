//! Accessors over KDL nodes.
//!
//! Settings are written as child nodes whose arguments hold the value:
//!
//! ```kdl
//! listener {
//!     port 9345
//!     cipher-suites "TLS_AES_128_GCM_SHA256" "TLS_AES_256_GCM_SHA384"
//! }
//! ```

use kdl::{KdlNode, KdlValue};

/// Find the first child node with the given name
pub fn get_child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|child| child.name().value() == name)
}

/// Positional arguments of a node (entries without a property name)
fn arguments(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|entry| entry.name().is_none())
        .map(|entry| entry.value())
}

/// First argument of a node as a string
pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    arguments(node)
        .next()
        .and_then(KdlValue::as_string)
        .map(str::to_string)
}

/// First argument of the named child as a string
pub fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    get_child(node, name).and_then(get_first_arg_string)
}

/// First argument of the named child as an integer
pub fn get_int_entry(node: &KdlNode, name: &str) -> Option<i128> {
    get_child(node, name)
        .and_then(|child| arguments(child).next())
        .and_then(KdlValue::as_integer)
}

/// First argument of the named child as a boolean.
///
/// A bare child node with no arguments (`enabled`) counts as `true`.
pub fn get_bool_entry(node: &KdlNode, name: &str) -> Option<bool> {
    let child = get_child(node, name)?;
    match arguments(child).next() {
        Some(value) => value.as_bool(),
        None => Some(true),
    }
}

/// All string arguments of the named child.
///
/// Repeated children accumulate, so both forms below yield two entries:
///
/// ```kdl
/// sans "a.example.com" "b.example.com"
/// sans "a.example.com"
/// sans "b.example.com"
/// ```
pub fn get_string_list(node: &KdlNode, name: &str) -> Vec<String> {
    let Some(children) = node.children() else {
        return Vec::new();
    };

    children
        .nodes()
        .iter()
        .filter(|child| child.name().value() == name)
        .flat_map(|child| {
            arguments(child)
                .filter_map(KdlValue::as_string)
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Convert a parsed integer to the target type with a readable error
pub fn int_to<T: TryFrom<i128>>(value: i128, field: &str) -> anyhow::Result<T> {
    T::try_from(value).map_err(|_| anyhow::anyhow!("Value {} out of range for '{}'", value, field))
}
