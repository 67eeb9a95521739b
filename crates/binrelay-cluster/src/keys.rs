//! Hierarchical coordination keys
//!
//! Every key lives under `/<cluster-name>`:
//!
//! ```text
//! /<cluster>/election                       leader lock (tree) / campaign name (lease)
//! /<cluster>/elected                        winning campaign key (lease)
//! /<cluster>/machine/<node>                 machine index per node identity
//! /<cluster>/position/<pipeline>            binlog position
//! /<cluster>/state/<pipeline>               pipeline run-state
//! /<cluster>/metadata/<kind>/<id>           replicated entity payload
//! ```
//!
//! Paths are built by joining segments: empty segments are dropped and
//! repeated or trailing slashes collapse, so normalising a path twice is a
//! no-op. Node identities are free-form (`host:port`, URLs) and are escaped
//! into a single segment with [`encode_segment`].

use crate::model::MetadataKind;

const ELECTION: &str = "election";
const ELECTED: &str = "elected";
const MACHINE: &str = "machine";
const POSITION: &str = "position";
const STATE: &str = "state";
const METADATA: &str = "metadata";

/// Join path segments into a normalised absolute path
pub fn join<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut path = String::new();
    for segment in segments {
        for part in segment.as_ref().split('/').filter(|p| !p.is_empty()) {
            path.push('/');
            path.push_str(part);
        }
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Normalise an existing path
pub fn normalize(path: &str) -> String {
    join([path])
}

/// Escape `%` and `/` so `raw` stays one path segment
pub fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`encode_segment`]; unknown escapes are kept verbatim
pub fn decode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let tail = &rest[at..];
        if tail.starts_with("%25") {
            out.push('%');
            rest = &tail[3..];
        } else if tail.starts_with("%2F") || tail.starts_with("%2f") {
            out.push('/');
            rest = &tail[3..];
        } else {
            out.push('%');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Key-path builder bound to one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPaths {
    root: String,
}

impl KeyPaths {
    pub fn new(cluster: &str) -> Self {
        Self {
            root: normalize(cluster),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn under(&self, segments: &[&str]) -> String {
        join(std::iter::once(self.root.as_str()).chain(segments.iter().copied()))
    }

    pub fn election(&self) -> String {
        self.under(&[ELECTION])
    }

    /// Pointer to the winning campaign key in lease mode
    pub fn elected(&self) -> String {
        self.under(&[ELECTED])
    }

    pub fn machine_parent(&self) -> String {
        self.under(&[MACHINE])
    }

    pub fn machine(&self, node: &str) -> String {
        self.under(&[MACHINE, &encode_segment(node)])
    }

    /// Node identity of a child listed under [`KeyPaths::machine_parent`]
    pub fn machine_node(&self, child: &str) -> String {
        decode_segment(child)
    }

    pub fn position_parent(&self) -> String {
        self.under(&[POSITION])
    }

    pub fn position(&self, pipeline_id: u64) -> String {
        self.under(&[POSITION, &pipeline_id.to_string()])
    }

    pub fn state_parent(&self) -> String {
        self.under(&[STATE])
    }

    pub fn state(&self, pipeline_id: u64) -> String {
        self.under(&[STATE, &pipeline_id.to_string()])
    }

    pub fn metadata_root(&self) -> String {
        self.under(&[METADATA])
    }

    /// Listing parent for one entity kind
    pub fn metadata_parent(&self, kind: MetadataKind) -> String {
        self.under(&[METADATA, kind.as_str()])
    }

    pub fn metadata_item(&self, kind: MetadataKind, id: u64) -> String {
        self.under(&[METADATA, kind.as_str(), &id.to_string()])
    }

    /// Every persistent parent that must exist before items are created
    pub fn persistent_parents(&self) -> Vec<String> {
        let mut parents = vec![
            self.root.clone(),
            self.machine_parent(),
            self.position_parent(),
            self.state_parent(),
            self.metadata_root(),
        ];
        parents.extend(
            MetadataKind::REPLICATED
                .into_iter()
                .map(|kind| self.metadata_parent(kind)),
        );
        parents
    }

    /// Map a metadata item path back to its kind and id
    pub fn parse_metadata_item(&self, path: &str) -> Option<(MetadataKind, u64)> {
        let path = normalize(path);
        let rest = path.strip_prefix(&self.metadata_root())?.strip_prefix('/')?;
        let mut parts = rest.split('/');
        let kind = parts.next()?.parse().ok()?;
        let id = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some((kind, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let keys = KeyPaths::new("binrelay");
        assert_eq!(keys.root(), "/binrelay");
        assert_eq!(keys.election(), "/binrelay/election");
        assert_eq!(keys.elected(), "/binrelay/elected");
        assert_eq!(keys.machine("node-1"), "/binrelay/machine/node-1");
        assert_eq!(keys.position(42), "/binrelay/position/42");
        assert_eq!(keys.state(42), "/binrelay/state/42");
        assert_eq!(
            keys.metadata_parent(MetadataKind::Pipeline),
            "/binrelay/metadata/pipeline"
        );
        assert_eq!(
            keys.metadata_item(MetadataKind::Source, 7),
            "/binrelay/metadata/source/7"
        );
    }

    #[test]
    fn test_normalization() {
        assert_eq!(KeyPaths::new("/binrelay/").root(), "/binrelay");
        assert_eq!(KeyPaths::new("//prod//east").election(), "/prod/east/election");
        assert_eq!(normalize("a//b/"), "/a/b");
        assert_eq!(normalize(&normalize("a//b/")), normalize("a//b/"));
        assert_eq!(normalize(""), "/");
        assert_eq!(join(["/a", "", "b/", "/c"]), "/a/b/c");
    }

    #[test]
    fn test_parse_metadata_item() {
        let keys = KeyPaths::new("binrelay");
        let path = keys.metadata_item(MetadataKind::Endpoint, 1234);
        assert_eq!(
            keys.parse_metadata_item(&path),
            Some((MetadataKind::Endpoint, 1234))
        );
        assert_eq!(keys.parse_metadata_item("/binrelay/metadata/pipeline"), None);
        assert_eq!(keys.parse_metadata_item("/binrelay/state/3"), None);
        assert_eq!(keys.parse_metadata_item("/other/metadata/source/1"), None);
        assert_eq!(
            keys.parse_metadata_item("/binrelay/metadata/source/x"),
            None
        );
    }

    #[test]
    fn test_url_node_is_one_segment() {
        let keys = KeyPaths::new("it");
        let node = "http://10.0.0.1:8060";
        let path = keys.machine(node);
        assert_eq!(path, "/it/machine/http:%2F%2F10.0.0.1:8060");

        let child = path
            .strip_prefix(&format!("{}/", keys.machine_parent()))
            .unwrap();
        assert!(!child.contains('/'));
        assert_eq!(keys.machine_node(child), node);
        assert_eq!(normalize(&path), path);
    }

    #[test]
    fn test_segment_escaping() {
        for raw in ["node-1", "10.0.0.1:8060", "a/b", "50%/x", "%2F", "", "%"] {
            assert_eq!(decode_segment(&encode_segment(raw)), raw);
        }
        assert_eq!(encode_segment("a/b%"), "a%2Fb%25");
        assert_eq!(decode_segment("100%"), "100%");
    }

    #[test]
    fn test_persistent_parents() {
        let keys = KeyPaths::new("c");
        let parents = keys.persistent_parents();
        assert!(parents.contains(&"/c/metadata/pipeline".to_string()));
        assert!(parents.contains(&"/c/machine".to_string()));
        assert_eq!(parents[0], "/c");
    }
}
