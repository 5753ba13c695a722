/// `${NAME}` placeholder substitution for workload templates
use std::collections::BTreeMap;

/// Outcome of substituting placeholders in a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    /// Placeholders that had no value, in order of first appearance
    pub unresolved: Vec<String>,
}

/// Replace every `${NAME}` whose name is in `vars`
///
/// Unknown placeholders are left in place and listed in `unresolved`. A `$`
/// not followed by `{NAME}` is copied through unchanged.
pub fn substitute(template: &str, vars: &BTreeMap<&str, &str>) -> Rendered {
    let mut text = String::with_capacity(template.len());
    let mut unresolved: Vec<String> = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        text.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        match after.find('}') {
            Some(end) if is_var_name(&after[..end]) => {
                let name = &after[..end];
                match vars.get(name) {
                    Some(value) => text.push_str(value),
                    None => {
                        text.push_str(&rest[start..start + 3 + end]);
                        if !unresolved.iter().any(|n| n == name) {
                            unresolved.push(name.to_string());
                        }
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                text.push_str("${");
                rest = after;
            }
        }
    }
    text.push_str(rest);

    Rendered { text, unresolved }
}

fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
