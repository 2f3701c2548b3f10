use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Mapping between paths reported by the remote runtime and local paths.
pub trait PathResolver {
    fn to_local(&self, remote_path: &str) -> String;
    fn to_remote(&self, local_path: &str) -> String;
}

#[derive(Debug, Default, Clone)]
pub struct SourceMap {
    /// Mapping from remote paths to the client paths.
    target_to_client: Vec<(String, String)>,
    /// Reverse mapping from client paths to remote paths.
    client_to_target: Vec<(String, String)>,
}

impl SourceMap {
    /// Convention: key = remote prefix, value = client prefix.
    pub fn new(map: &BTreeMap<String, String>) -> Self {
        let mut sm = SourceMap::default();
        for (target_prefix, client_prefix) in map {
            sm.target_to_client
                .push((Self::norm_prefix(target_prefix), client_prefix.clone()));
            sm.client_to_target
                .push((Self::norm_prefix(client_prefix), target_prefix.clone()));
        }

        // Longest prefix wins.
        sm.target_to_client.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        sm.client_to_target.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        sm
    }

    pub fn map_target_to_client(&self, target_path: &str) -> String {
        Self::apply_map(target_path, &self.target_to_client)
    }

    pub fn map_client_to_target(&self, client_path: &str) -> String {
        Self::apply_map(client_path, &self.client_to_target)
    }

    fn apply_map(path: &str, mapping: &[(String, String)]) -> String {
        let normalized = Self::norm_path(path);
        for (from_norm, to_raw) in mapping {
            if let Some(suffix) = normalized.strip_prefix(from_norm.as_str()) {
                return Self::join(to_raw, suffix);
            }
        }
        path.to_string()
    }

    fn join(prefix: &str, suffix: &str) -> String {
        if suffix.is_empty() {
            return prefix.to_string();
        }
        let mut out = prefix.to_string();
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(suffix);
        out
    }

    fn norm_prefix(s: &str) -> String {
        let mut out = Self::norm_path(s);
        if !out.ends_with('/') {
            out.push('/');
        }
        out
    }

    fn norm_path(s: &str) -> String {
        s.replace('\\', "/")
    }
}

/// Source map plus source roots of the project. A relative remote path is looked up in the
/// roots, first root that contains the file wins.
#[derive(Debug, Default, Clone)]
pub struct SourceResolver {
    map: SourceMap,
    roots: Vec<PathBuf>,
}

impl SourceResolver {
    pub fn new(map: SourceMap) -> Self {
        Self { map, roots: vec![] }
    }

    pub fn set_roots(&mut self, roots: Vec<PathBuf>) {
        self.roots = roots;
    }
}

impl PathResolver for SourceResolver {
    fn to_local(&self, remote_path: &str) -> String {
        let mapped = self.map.map_target_to_client(remote_path);
        if Path::new(&mapped).is_absolute() {
            return mapped;
        }
        self.roots
            .iter()
            .map(|root| root.join(&mapped))
            .find(|candidate| candidate.exists())
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or(mapped)
    }

    fn to_remote(&self, local_path: &str) -> String {
        self.map.map_client_to_target(local_path)
    }
}
