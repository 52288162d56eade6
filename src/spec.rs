// src/spec.rs

//! Concrete specs as consumed by the buildcache and the installer
//!
//! A concrete spec is a DAG of nodes keyed by their DAG hash. The on-disk
//! form is a flat node list (root first) in which every dependency edge
//! references its target by hash:
//!
//! ```json
//! {"spec": {"_meta": {"version": 5}, "nodes": [
//!   {"name": "libdwarf", "version": "20180129", "arch": {...}, "compiler": {...},
//!    "hash": "...", "dependencies": [{"name": "libelf", "hash": "...",
//!    "parameters": {"deptypes": ["build", "link"]}}]}
//! ]}}
//! ```
//!
//! Specs are produced elsewhere (solver, parser); this module only parses,
//! serializes and traverses them. The optional `build` recipe is the
//! package's ordered phase sequence, run verbatim by the build worker.

use crate::error::{Error, Result};
use crate::hash;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Version of the node-list format written by this crate
pub const SPEC_FORMAT_VERSION: u32 = 5;

/// Dependency types carried on an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepTypes(u8);

impl DepTypes {
    pub const NONE: Self = Self(0);
    pub const BUILD: Self = Self(1);
    pub const LINK: Self = Self(1 << 1);
    pub const RUN: Self = Self(1 << 2);
    pub const TEST: Self = Self(1 << 3);
    pub const ALL: Self = Self(0b1111);

    const NAMES: [(Self, &'static str); 4] = [
        (Self::BUILD, "build"),
        (Self::LINK, "link"),
        (Self::RUN, "run"),
        (Self::TEST, "test"),
    ];

    /// Whether any flag is shared with `other`
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether every flag of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Names as written in spec files
    pub fn names(self) -> Vec<String> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| (*name).to_string())
            .collect()
    }

    /// Parse a list of dependency type names
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut types = Self::NONE;
        for name in names {
            let flag = Self::NAMES
                .iter()
                .find(|(_, n)| *n == name.as_ref())
                .map(|(flag, _)| *flag)
                .ok_or_else(|| {
                    Error::InvalidSpec(format!("unknown dependency type '{}'", name.as_ref()))
                })?;
            types = types | flag;
        }
        Ok(types)
    }
}

impl BitOr for DepTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Target platform of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchSpec {
    pub platform: String,
    pub platform_os: String,
    pub target: String,
}

impl ArchSpec {
    /// Whether this architecture can run on the current host
    pub fn matches_host(&self) -> bool {
        self.platform == std::env::consts::OS && self.target == std::env::consts::ARCH
    }
}

impl Default for ArchSpec {
    fn default() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            platform_os: "generic".to_string(),
            target: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Compiler a node was built with
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompilerSpec {
    pub name: String,
    pub version: String,
}

impl Default for CompilerSpec {
    fn default() -> Self {
        Self {
            name: "gcc".to_string(),
            version: "12.3.0".to_string(),
        }
    }
}

/// Parameters attached to a dependency edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeParameters {
    pub deptypes: Vec<String>,
}

/// Dependency edge as stored in a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub name: String,
    pub hash: String,
    pub parameters: EdgeParameters,
}

/// One named step of a source build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPhase {
    pub name: String,
    /// Shell script run with `sh -c` in the stage directory
    pub script: String,
}

/// Ordered build phases of a package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecipe {
    pub phases: Vec<BuildPhase>,
}

/// A single node of a concrete spec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecNode {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub arch: ArchSpec,
    #[serde(default)]
    pub compiler: CompilerSpec,
    #[serde(default)]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildRecipe>,
}

impl SpecNode {
    /// DAG hash of this node's content (its own `hash` field excluded)
    pub fn compute_hash(&self) -> String {
        let mut canonical = self.clone();
        canonical.hash.clear();
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        hash::dag_hash(&bytes)
    }

    fn validate(&self) -> Result<()> {
        for (what, value) in [("name", &self.name), ("version", &self.version)] {
            if value.is_empty() || value.contains('/') || value.contains(char::is_whitespace) {
                return Err(Error::InvalidSpec(format!("invalid {} '{}'", what, value)));
            }
        }
        if !hash::is_dag_hash(&self.hash) {
            return Err(Error::InvalidSpec(format!(
                "node '{}' has invalid hash '{}'",
                self.name, self.hash
            )));
        }
        Ok(())
    }
}

/// `_meta` block of a node list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecMeta {
    pub version: u32,
}

/// Node list of a spec document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeList {
    #[serde(rename = "_meta")]
    pub meta: SpecMeta,
    pub nodes: Vec<SpecNode>,
}

/// Checksum of the binary tarball recorded in legacy spec files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryCacheChecksum {
    pub hash_algorithm: String,
    pub hash: String,
}

/// A spec file: node list plus optional buildcache metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecDocument {
    pub spec: NodeList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildcache_layout_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_cache_checksum: Option<BinaryCacheChecksum>,
}

impl SpecDocument {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json_pretty(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Reconstruct the spec described by this document
    pub fn to_spec(&self) -> Result<Spec> {
        Spec::from_nodes(&self.spec.nodes)
    }
}

struct SpecData {
    node: SpecNode,
    edges: Vec<(DepTypes, Spec)>,
}

/// A concrete spec: a node plus its dependency sub-DAG
///
/// Cheap to clone; equality and hashing use the DAG hash.
#[derive(Clone)]
pub struct Spec {
    inner: Arc<SpecData>,
}

impl Spec {
    /// Build a spec from a node list whose first node is the root
    pub fn from_nodes(nodes: &[SpecNode]) -> Result<Self> {
        let root = nodes
            .first()
            .ok_or_else(|| Error::InvalidSpec("spec has no nodes".to_string()))?;
        let root_hash = if root.hash.is_empty() {
            root.compute_hash()
        } else {
            root.hash.clone()
        };
        let map: HashMap<String, SpecNode> = nodes
            .iter()
            .map(|n| {
                let mut node = n.clone();
                if node.hash.is_empty() {
                    node.hash = node.compute_hash();
                }
                (node.hash.clone(), node)
            })
            .collect();
        Self::from_node_map(&map, &root_hash)
    }

    /// Build the spec rooted at `root_hash` from a hash-keyed node map
    pub fn from_node_map(map: &HashMap<String, SpecNode>, root_hash: &str) -> Result<Self> {
        let mut memo = HashMap::new();
        let mut visiting = HashSet::new();
        Self::build(root_hash, map, &mut memo, &mut visiting)
    }

    fn build(
        hash: &str,
        map: &HashMap<String, SpecNode>,
        memo: &mut HashMap<String, Spec>,
        visiting: &mut HashSet<String>,
    ) -> Result<Self> {
        if let Some(spec) = memo.get(hash) {
            return Ok(spec.clone());
        }
        let node = map
            .get(hash)
            .ok_or_else(|| Error::InvalidSpec(format!("missing node with hash {}", hash)))?;
        node.validate()?;
        if !visiting.insert(hash.to_string()) {
            return Err(Error::InvalidSpec(format!(
                "dependency cycle through {}",
                node.name
            )));
        }

        let mut edges = Vec::with_capacity(node.dependencies.len());
        for edge in &node.dependencies {
            let deptypes = DepTypes::from_names(&edge.parameters.deptypes)?;
            let child = Self::build(&edge.hash, map, memo, visiting)?;
            edges.push((deptypes, child));
        }
        visiting.remove(hash);

        let spec = Self {
            inner: Arc::new(SpecData {
                node: node.clone(),
                edges,
            }),
        };
        memo.insert(hash.to_string(), spec.clone());
        Ok(spec)
    }

    pub fn from_document(doc: &SpecDocument) -> Result<Self> {
        doc.to_spec()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        SpecDocument::from_json(bytes)?.to_spec()
    }

    /// Spec document containing every node of this DAG, root first
    pub fn to_document(&self) -> SpecDocument {
        SpecDocument {
            spec: NodeList {
                meta: SpecMeta {
                    version: SPEC_FORMAT_VERSION,
                },
                nodes: self.traverse().iter().map(|s| s.node().clone()).collect(),
            },
            buildcache_layout_version: None,
            binary_cache_checksum: None,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        self.to_document().to_json_pretty()
    }

    pub fn node(&self) -> &SpecNode {
        &self.inner.node
    }

    pub fn name(&self) -> &str {
        &self.inner.node.name
    }

    pub fn version(&self) -> &str {
        &self.inner.node.version
    }

    pub fn dag_hash(&self) -> &str {
        &self.inner.node.hash
    }

    /// First seven characters of the DAG hash
    pub fn short_hash(&self) -> &str {
        let hash = self.dag_hash();
        &hash[..hash.len().min(7)]
    }

    pub fn arch(&self) -> &ArchSpec {
        &self.inner.node.arch
    }

    pub fn compiler(&self) -> &CompilerSpec {
        &self.inner.node.compiler
    }

    /// `<platform>-<os>-<target>`, as used in legacy buildcache paths
    pub fn os_arch(&self) -> String {
        let arch = self.arch();
        format!("{}-{}-{}", arch.platform, arch.platform_os, arch.target)
    }

    /// `<compiler>-<version>`, as used in legacy buildcache paths
    pub fn compiler_string(&self) -> String {
        format!("{}-{}", self.compiler().name, self.compiler().version)
    }

    pub fn recipe(&self) -> Option<&BuildRecipe> {
        self.inner.node.build.as_ref()
    }

    pub fn edges(&self) -> &[(DepTypes, Spec)] {
        &self.inner.edges
    }

    /// Direct dependencies reachable through any of `deptypes`
    pub fn dependencies(&self, deptypes: DepTypes) -> Vec<Spec> {
        self.inner
            .edges
            .iter()
            .filter(|(types, _)| types.intersects(deptypes))
            .map(|(_, spec)| spec.clone())
            .collect()
    }

    /// Every node of the DAG exactly once, root first
    pub fn traverse(&self) -> Vec<Spec> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(spec) = stack.pop() {
            if !seen.insert(spec.dag_hash().to_string()) {
                continue;
            }
            for (_, child) in spec.edges().iter().rev() {
                stack.push(child.clone());
            }
            out.push(spec);
        }
        out
    }

    /// Nodes reachable through `deptypes` edges, dependencies before dependents
    pub fn traverse_deps_first(&self, deptypes: DepTypes) -> Vec<Spec> {
        fn visit(spec: &Spec, deptypes: DepTypes, seen: &mut HashSet<String>, out: &mut Vec<Spec>) {
            if !seen.insert(spec.dag_hash().to_string()) {
                return;
            }
            for child in spec.dependencies(deptypes) {
                visit(&child, deptypes, seen, out);
            }
            out.push(spec.clone());
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        visit(self, deptypes, &mut seen, &mut out);
        out
    }

    /// Installation prefix of this spec under `root`
    pub fn install_prefix(&self, root: &Path) -> PathBuf {
        let arch = self.arch();
        root.join(format!("{}-{}", arch.platform, arch.target)).join(format!(
            "{}-{}-{}",
            self.name(),
            self.version(),
            self.dag_hash()
        ))
    }

    /// Short human-readable form, `name@version/hash7`
    pub fn cformat(&self) -> String {
        format!("{}@{}/{}", self.name(), self.version(), self.short_hash())
    }
}

impl PartialEq for Spec {
    fn eq(&self, other: &Self) -> bool {
        self.dag_hash() == other.dag_hash()
    }
}

impl Eq for Spec {}

impl std::hash::Hash for Spec {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.dag_hash().hash(state);
    }
}

impl fmt::Debug for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spec")
            .field("name", &self.name())
            .field("version", &self.version())
            .field("hash", &self.dag_hash())
            .finish()
    }
}

impl fmt::Display for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cformat())
    }
}

/// Assembles concrete specs bottom-up, computing DAG hashes
///
/// ```ignore
/// let libelf = SpecBuilder::new("libelf", "0.8.13").build();
/// let libdwarf = SpecBuilder::new("libdwarf", "20180129")
///     .depends_on(&libelf, DepTypes::BUILD | DepTypes::LINK)
///     .phase("install", "make install")
///     .build();
/// ```
pub struct SpecBuilder {
    node: SpecNode,
    deps: Vec<(DepTypes, Spec)>,
}

impl SpecBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            node: SpecNode {
                name: name.into(),
                version: version.into(),
                arch: ArchSpec::default(),
                compiler: CompilerSpec::default(),
                hash: String::new(),
                dependencies: Vec::new(),
                build: None,
            },
            deps: Vec::new(),
        }
    }

    pub fn arch(mut self, platform: &str, platform_os: &str, target: &str) -> Self {
        self.node.arch = ArchSpec {
            platform: platform.to_string(),
            platform_os: platform_os.to_string(),
            target: target.to_string(),
        };
        self
    }

    pub fn compiler(mut self, name: &str, version: &str) -> Self {
        self.node.compiler = CompilerSpec {
            name: name.to_string(),
            version: version.to_string(),
        };
        self
    }

    pub fn depends_on(mut self, dep: &Spec, deptypes: DepTypes) -> Self {
        self.deps.push((deptypes, dep.clone()));
        self
    }

    pub fn phase(mut self, name: &str, script: &str) -> Self {
        self.node
            .build
            .get_or_insert_with(BuildRecipe::default)
            .phases
            .push(BuildPhase {
                name: name.to_string(),
                script: script.to_string(),
            });
        self
    }

    pub fn build(mut self) -> Spec {
        self.deps.sort_by(|a, b| a.1.name().cmp(b.1.name()));
        self.node.dependencies = self
            .deps
            .iter()
            .map(|(types, dep)| DependencyEdge {
                name: dep.name().to_string(),
                hash: dep.dag_hash().to_string(),
                parameters: EdgeParameters {
                    deptypes: types.names(),
                },
            })
            .collect();
        self.node.hash = self.node.compute_hash();
        Spec {
            inner: Arc::new(SpecData {
                node: self.node,
                edges: self.deps,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn libdwarf() -> (Spec, Spec) {
        let libelf = SpecBuilder::new("libelf", "0.8.13").build();
        let libdwarf = SpecBuilder::new("libdwarf", "20180129")
            .depends_on(&libelf, DepTypes::BUILD | DepTypes::LINK)
            .phase("install", "true")
            .build();
        (libelf, libdwarf)
    }

    #[test]
    fn test_deptypes_names() {
        let types = DepTypes::BUILD | DepTypes::RUN;
        assert_eq!(types.names(), vec!["build", "run"]);
        assert_eq!(DepTypes::from_names(&["build", "run"]).unwrap(), types);
        assert!(DepTypes::from_names(&["bogus"]).is_err());
        assert!(types.intersects(DepTypes::RUN));
        assert!(!types.intersects(DepTypes::LINK));
    }

    #[test]
    fn test_builder_hash_depends_on_dependencies() {
        let a = SpecBuilder::new("zlib", "1.3").build();
        let b = SpecBuilder::new("zlib", "1.3").build();
        assert_eq!(a.dag_hash(), b.dag_hash());
        assert_eq!(a.dag_hash().len(), hash::DAG_HASH_LEN);

        let (libelf, libdwarf) = libdwarf();
        let other_elf = SpecBuilder::new("libelf", "0.8.12").build();
        let other_dwarf = SpecBuilder::new("libdwarf", "20180129")
            .depends_on(&other_elf, DepTypes::BUILD | DepTypes::LINK)
            .phase("install", "true")
            .build();
        assert_ne!(libdwarf.dag_hash(), other_dwarf.dag_hash());
        assert_ne!(libelf.dag_hash(), libdwarf.dag_hash());
    }

    #[test]
    fn test_document_roundtrip_preserves_dag() {
        let (libelf, libdwarf) = libdwarf();
        let json = libdwarf.to_json().unwrap();
        let parsed = Spec::from_json(&json).unwrap();

        assert_eq!(parsed, libdwarf);
        assert_eq!(parsed.dependencies(DepTypes::LINK), vec![libelf.clone()]);
        assert!(parsed.dependencies(DepTypes::RUN).is_empty());
        assert_eq!(parsed.recipe().unwrap().phases[0].name, "install");
    }

    #[test]
    fn test_missing_node_is_rejected() {
        let (_, libdwarf) = libdwarf();
        let mut doc = libdwarf.to_document();
        doc.spec.nodes.truncate(1);
        assert!(matches!(doc.to_spec(), Err(Error::InvalidSpec(_))));
    }

    #[test]
    fn test_invalid_name_is_rejected() {
        let spec = SpecBuilder::new("../evil", "1.0").build();
        let doc = spec.to_document();
        assert!(doc.to_spec().is_err());
    }

    #[test]
    fn test_traversal_orders() {
        let (libelf, libdwarf) = libdwarf();
        let all = libdwarf.traverse();
        assert_eq!(all[0], libdwarf);
        assert_eq!(all.len(), 2);

        let deps_first = libdwarf.traverse_deps_first(DepTypes::ALL);
        assert_eq!(deps_first, vec![libelf, libdwarf.clone()]);

        let link_run = libdwarf.traverse_deps_first(DepTypes::RUN);
        assert_eq!(link_run, vec![libdwarf]);
    }

    #[test]
    fn test_paths_and_formatting() {
        let spec = SpecBuilder::new("zlib", "1.3")
            .arch("linux", "ubuntu22.04", "x86_64")
            .compiler("gcc", "12.3.0")
            .build();
        assert_eq!(spec.os_arch(), "linux-ubuntu22.04-x86_64");
        assert_eq!(spec.compiler_string(), "gcc-12.3.0");
        assert_eq!(spec.cformat(), format!("zlib@1.3/{}", &spec.dag_hash()[..7]));

        let prefix = spec.install_prefix(Path::new("/opt/strata"));
        assert_eq!(
            prefix,
            PathBuf::from(format!("/opt/strata/linux-x86_64/zlib-1.3-{}", spec.dag_hash()))
        );
    }
}
