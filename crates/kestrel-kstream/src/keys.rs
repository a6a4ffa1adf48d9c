//! Registry-key name canonicalization.

/// Native root prefixes and their user-facing names, longest first so
/// the most specific root wins.
const ROOTS: &[(&str, &str)] = &[
    ("\\REGISTRY\\MACHINE\\SOFTWARE\\CLASSES", "HKCR"),
    ("\\REGISTRY\\MACHINE", "HKLM"),
    ("\\REGISTRY\\USER", "HKU"),
];

/// Rewrites a native registry path as `<Root>\<Subkey>`. Names whose
/// root is not recognized pass through untouched.
pub fn format(name: &str) -> String {
    for (prefix, root) in ROOTS {
        let Some(head) = name.get(..prefix.len()) else {
            continue;
        };
        if !head.eq_ignore_ascii_case(prefix) {
            continue;
        }
        let subkey = name[prefix.len()..].trim_start_matches('\\');
        if subkey.is_empty() {
            return (*root).to_string();
        }
        return format!("{root}\\{subkey}");
    }
    name.to_string()
}
