//! Datums: the unit of dispatchable work.
//!
//! Each input's file tree is split into groups by its glob, and the
//! groups of all inputs are combined by the pipeline's join mode. A
//! datum's identity hashes the pipeline salt with every input file's path
//! and content, so the same inputs under the same transform always yield
//! the same ID.

use serde::{Deserialize, Serialize};
use sluice_core::{CoreError, Hash, Hasher};
use sluice_storage::FileTree;
use std::fmt;
use std::str::FromStr;

/// How an input tree is split into datum parts. Serialized as its
/// pattern string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Glob {
    /// `/`: the whole tree is one part
    #[default]
    Root,
    /// `/*`: each top-level file or directory is a part
    TopLevel,
    /// `/**`: each file is a part
    Files,
}

impl Glob {
    /// Split a tree into parts in path order. An empty tree has none.
    #[must_use]
    pub fn split(&self, tree: &FileTree) -> Vec<FileTree> {
        if tree.is_empty() {
            return Vec::new();
        }
        match self {
            Self::Root => vec![tree.clone()],
            Self::TopLevel => tree.top_level().into_values().collect(),
            Self::Files => tree
                .iter()
                .map(|(path, entry)| std::iter::once((path.clone(), *entry)).collect())
                .collect(),
        }
    }
}

impl FromStr for Glob {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "/" | "" => Ok(Self::Root),
            "/*" => Ok(Self::TopLevel),
            "/**" => Ok(Self::Files),
            other => Err(CoreError::validation(
                "glob",
                format!("unsupported glob {:?} (use \"/\", \"/*\" or \"/**\")", other),
            )),
        }
    }
}

impl TryFrom<String> for Glob {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Glob> for String {
    fn from(glob: Glob) -> Self {
        glob.to_string()
    }
}

impl fmt::Display for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "/"),
            Self::TopLevel => write!(f, "/*"),
            Self::Files => write!(f, "/**"),
        }
    }
}

/// How parts of several inputs are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Cartesian product of all inputs' parts
    #[default]
    Cross,
    /// Index-aligned pairing; extra parts of longer inputs are dropped
    Zip,
}

/// Datum identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatumId(Hash);

impl DatumId {
    /// Wrap a hash
    #[must_use]
    pub const fn from_hash(hash: Hash) -> Self {
        Self(hash)
    }

    /// Underlying hash
    #[must_use]
    pub const fn hash(&self) -> &Hash {
        &self.0
    }

    /// Short form for logs
    #[must_use]
    pub fn short(&self) -> String {
        self.0.short()
    }
}

impl fmt::Display for DatumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One input's share of a datum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumPart {
    /// Input name
    pub input: String,
    /// Files of this input that belong to the datum
    pub files: FileTree,
}

/// A unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datum {
    /// Identity
    pub id: DatumId,
    /// Position in enumeration order
    pub index: usize,
    /// One part per input, in input order
    pub parts: Vec<DatumPart>,
}

/// A named input tree ready for enumeration
#[derive(Debug, Clone)]
pub struct InputTree {
    /// Input name
    pub name: String,
    /// Files of the input commit (or host directory)
    pub tree: FileTree,
    /// Split rule
    pub glob: Glob,
}

fn datum_id(salt: &Hash, parts: &[DatumPart]) -> DatumId {
    let mut hasher = Hasher::new();
    hasher.hash_field(salt);
    for part in parts {
        hasher.str_field(&part.input);
        for (path, entry) in part.files.iter() {
            hasher.str_field(path).hash_field(&entry.address);
        }
    }
    DatumId(hasher.finish())
}

/// Enumerate the datums of a set of inputs.
///
/// Deterministic: the same salt, trees and join always give the same
/// datums in the same order. Any input with no parts yields no datums
/// under `Cross`; `Zip` stops at the shortest input.
#[must_use]
pub fn enumerate(salt: &Hash, inputs: &[InputTree], join: JoinMode) -> Vec<Datum> {
    let split: Vec<Vec<DatumPart>> = inputs
        .iter()
        .map(|input| {
            input
                .glob
                .split(&input.tree)
                .into_iter()
                .map(|files| DatumPart {
                    input: input.name.clone(),
                    files,
                })
                .collect()
        })
        .collect();

    if split.is_empty() || split.iter().any(Vec::is_empty) {
        return Vec::new();
    }

    let combos: Vec<Vec<DatumPart>> = match join {
        JoinMode::Cross => split.iter().fold(vec![Vec::new()], |acc, parts| {
            acc.iter()
                .flat_map(|prefix| {
                    parts.iter().map(move |part| {
                        let mut next = prefix.clone();
                        next.push(part.clone());
                        next
                    })
                })
                .collect()
        }),
        JoinMode::Zip => {
            let len = split.iter().map(Vec::len).min().unwrap_or(0);
            (0..len)
                .map(|i| split.iter().map(|parts| parts[i].clone()).collect())
                .collect()
        }
    };

    combos
        .into_iter()
        .enumerate()
        .map(|(index, parts)| Datum {
            id: datum_id(salt, &parts),
            index,
            parts,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sluice_storage::FileEntry;

    fn tree(paths: &[&str]) -> FileTree {
        paths
            .iter()
            .map(|p| {
                (
                    p.to_string(),
                    FileEntry {
                        address: Hash::compute(p.as_bytes()),
                        size: p.len() as u64,
                    },
                )
            })
            .collect()
    }

    fn input(name: &str, paths: &[&str], glob: Glob) -> InputTree {
        InputTree {
            name: name.to_string(),
            tree: tree(paths),
            glob,
        }
    }

    #[test]
    fn test_glob_parse() {
        assert_eq!("/".parse::<Glob>().unwrap(), Glob::Root);
        assert_eq!("/*".parse::<Glob>().unwrap(), Glob::TopLevel);
        assert_eq!("/**".parse::<Glob>().unwrap(), Glob::Files);
        assert!("/foo/*".parse::<Glob>().is_err());
        assert_eq!(serde_json::to_string(&Glob::TopLevel).unwrap(), "\"/*\"");
        assert_eq!(serde_json::from_str::<Glob>("\"/**\"").unwrap(), Glob::Files);
        assert!(serde_json::from_str::<Glob>("\"*.txt\"").is_err());
    }

    #[test]
    fn test_glob_split() {
        let t = tree(&["/a/1", "/a/2", "/b"]);
        assert_eq!(Glob::Root.split(&t).len(), 1);
        assert_eq!(Glob::TopLevel.split(&t).len(), 2);
        assert_eq!(Glob::Files.split(&t).len(), 3);
        assert!(Glob::Root.split(&FileTree::new()).is_empty());
    }

    #[test]
    fn test_cross_product() {
        let salt = Hash::compute(b"p");
        let datums = enumerate(
            &salt,
            &[
                input("x", &["/1", "/2"], Glob::TopLevel),
                input("y", &["/a", "/b", "/c"], Glob::TopLevel),
            ],
            JoinMode::Cross,
        );
        assert_eq!(datums.len(), 6);
        assert_eq!(datums[0].parts[0].input, "x");
        assert_eq!(datums[0].parts[1].input, "y");
        let ids: std::collections::HashSet<_> = datums.iter().map(|d| d.id).collect();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn test_zip_truncates() {
        let salt = Hash::compute(b"p");
        let datums = enumerate(
            &salt,
            &[
                input("x", &["/1", "/2"], Glob::Files),
                input("y", &["/a", "/b", "/c"], Glob::Files),
            ],
            JoinMode::Zip,
        );
        assert_eq!(datums.len(), 2);
        assert!(datums[1].parts[1].files.get("/b").is_some());
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        let salt = Hash::compute(b"p");
        let datums = enumerate(
            &salt,
            &[input("x", &["/1"], Glob::Files), input("y", &[], Glob::Files)],
            JoinMode::Cross,
        );
        assert!(datums.is_empty());
        assert!(enumerate(&salt, &[], JoinMode::Cross).is_empty());
    }

    #[test]
    fn test_salt_changes_identity() {
        let inputs = [input("x", &["/1"], Glob::Files)];
        let a = enumerate(&Hash::compute(b"p1"), &inputs, JoinMode::Cross);
        let b = enumerate(&Hash::compute(b"p2"), &inputs, JoinMode::Cross);
        assert_ne!(a[0].id, b[0].id);
    }

    proptest! {
        #[test]
        fn datum_identity_is_deterministic(
            names in proptest::collection::btree_set("[a-z]{1,4}", 1..6),
            other in proptest::collection::btree_set("[a-z]{1,4}", 1..4),
        ) {
            let a: Vec<String> = names.iter().map(|n| format!("/{}", n)).collect();
            let b: Vec<String> = other.iter().map(|n| format!("/{}", n)).collect();
            let a: Vec<&str> = a.iter().map(String::as_str).collect();
            let b: Vec<&str> = b.iter().map(String::as_str).collect();
            let inputs = [input("a", &a, Glob::Files), input("b", &b, Glob::Files)];
            let salt = Hash::compute(b"salt");

            let first = enumerate(&salt, &inputs, JoinMode::Cross);
            let second = enumerate(&salt, &inputs, JoinMode::Cross);
            prop_assert_eq!(first.len(), a.len() * b.len());
            prop_assert_eq!(first, second);
        }
    }
}
