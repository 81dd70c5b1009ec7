use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context;

#[derive(Debug, Default)]
struct Node {
    children: HashMap<Box<str>, Node>,
    terminal: bool,
}

/// 逆序标签前缀树：`example.cn` 以 `cn` -> `example` 的顺序插入。
/// A set of zone suffixes stored as a reverse-label trie. `matches` walks the
/// query name's labels right to left, so `www.example.cn` reaches the node
/// that `example.cn` marked terminal without rescanning per suffix.
#[derive(Debug, Default)]
pub struct DomainSuffixSet {
    root: Node,
    len: usize,
}

impl DomainSuffixSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a UTF-8 text file, one domain per line. Blank lines skipped.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("read domain suffix list {}", path.display()))?;
        let mut set = Self::new();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            set.insert(line);
        }
        Ok(set)
    }

    pub fn insert(&mut self, domain: &str) {
        let normalized = normalize(domain);
        let mut node = &mut self.root;
        for label in normalized.rsplit('.') {
            if label.is_empty() {
                continue;
            }
            node = node.children.entry(Box::from(label)).or_default();
        }
        if !node.terminal {
            node.terminal = true;
            self.len += 1;
        }
    }

    /// True when any suffix of `name` (including `name` itself) is in the set.
    pub fn matches(&self, name: &str) -> bool {
        let normalized = normalize(name);
        let mut node = &self.root;
        for label in normalized.rsplit('.') {
            if label.is_empty() {
                continue;
            }
            match node.children.get(label) {
                Some(next) => {
                    if next.terminal {
                        return true;
                    }
                    node = next;
                }
                None => return false,
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
