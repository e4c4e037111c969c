use crate::error::{Result, WafError};
use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use tracing::{debug, warn};

/// Binary trie over the high-to-low bits of an IPv4 address.
///
/// Each inserted CIDR marks its terminal node as a leaf; lookups return true
/// at the first leaf on the path, which gives longest-prefix-match semantics
/// through early exit. The trie is built once and replaced wholesale on
/// reload, so it carries no interior locking.
#[derive(Debug, Default)]
pub struct CidrTrie {
    root: Node,
    entries: usize,
}

#[derive(Debug, Default)]
struct Node {
    children: [Option<Box<Node>>; 2],
    leaf: bool,
}

impl CidrTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a textual CIDR (`10.0.0.0/8`) or bare address (`/32`).
    pub fn insert(&mut self, cidr: &str) -> Result<()> {
        let net: Ipv4Net = if cidr.contains('/') {
            cidr.parse()
                .map_err(|e| WafError::Config(format!("invalid CIDR '{cidr}': {e}")))?
        } else {
            let addr: Ipv4Addr = cidr
                .parse()
                .map_err(|e| WafError::Config(format!("invalid IP address '{cidr}': {e}")))?;
            Ipv4Net::new(addr, 32).expect("/32 prefix is always valid")
        };

        let bits = u32::from(net.network());
        let mut node = &mut self.root;
        for i in 0..net.prefix_len() {
            let bit = ((bits >> (31 - i)) & 1) as usize;
            node = node.children[bit].get_or_insert_with(Box::default);
        }
        node.leaf = true;
        self.entries += 1;
        Ok(())
    }

    /// Walk up to 32 bits; true at the first leaf seen along the path.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let v4 = match ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => return false,
        };

        let bits = u32::from(v4);
        let mut node = &self.root;
        if node.leaf {
            return true;
        }
        for i in 0..32 {
            let bit = ((bits >> (31 - i)) & 1) as usize;
            match &node.children[bit] {
                Some(child) => {
                    if child.leaf {
                        return true;
                    }
                    node = child;
                }
                None => return false,
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Build a trie from a blacklist file: one entry per line, `#` comments
    /// and blank lines ignored, unparsable entries skipped with a warning.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WafError::Config(format!("failed to read IP blacklist '{path}': {e}")))?;

        let mut trie = Self::new();
        for (line_no, line) in content.lines().enumerate() {
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            if let Err(e) = trie.insert(entry) {
                warn!(
                    file = %path,
                    line = line_no + 1,
                    entry = %entry,
                    error = %e,
                    "Skipping unparsable IP blacklist entry"
                );
            }
        }

        debug!(file = %path, entries = trie.len(), "IP blacklist loaded");
        Ok(trie)
    }
}

/// Exact-match set of lower-cased blacklisted host names.
#[derive(Debug, Default)]
pub struct DnsBlacklist {
    hosts: HashSet<String>,
}

impl DnsBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: &str) {
        self.hosts.insert(host.trim().to_lowercase());
    }

    /// Exact match on the Host header, ignoring case and any port suffix.
    pub fn contains(&self, host: &str) -> bool {
        let host = host.trim().to_lowercase();
        let bare = host.rsplit_once(':').map_or(host.as_str(), |(h, port)| {
            if port.chars().all(|c| c.is_ascii_digit()) {
                h
            } else {
                host.as_str()
            }
        });
        self.hosts.contains(bare)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Same line format as the IP blacklist.
    pub fn from_file(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Err(WafError::Config(format!(
                "DNS blacklist file '{path}' does not exist"
            )));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| WafError::Config(format!("failed to read DNS blacklist '{path}': {e}")))?;

        let mut list = Self::new();
        for line in content.lines() {
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            list.insert(entry);
        }

        debug!(file = %path, entries = list.len(), "DNS blacklist loaded");
        Ok(list)
    }
}
