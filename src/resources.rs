//! Repo documents compiled into the binary and addressed with `pkg://` urls.

const PACKAGED: &[(&str, &str)] = &[
    (
        "defaults/stackwright.toml",
        include_str!("../resources/defaults/stackwright.toml"),
    ),
    (
        "recipes/stackwright.toml",
        include_str!("../resources/recipes/stackwright.toml"),
    ),
    (
        "recipes/master/stackwright.toml",
        include_str!("../resources/recipes/master/stackwright.toml"),
    ),
    (
        "recipes/master/siril.toml",
        include_str!("../resources/recipes/master/siril.toml"),
    ),
    (
        "recipes/osc_dual_duo/stackwright.toml",
        include_str!("../resources/recipes/osc_dual_duo/stackwright.toml"),
    ),
    (
        "recipes/osc_single/stackwright.toml",
        include_str!("../resources/recipes/osc_single/stackwright.toml"),
    ),
];

/// Returns the packaged file at `path` (relative to the `pkg://` root).
pub fn packaged_file(path: &str) -> Option<&'static str> {
    let normalized = normalize(path);
    PACKAGED
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|(_, content)| *content)
}

pub fn packaged_names() -> impl Iterator<Item = &'static str> {
    PACKAGED.iter().map(|(name, _)| *name)
}

fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}
