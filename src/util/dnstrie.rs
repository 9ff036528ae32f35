//! DNS zone trie built on the crit-bit tree
//!
//! A zone `example.com` must match itself and any subdomain
//! (`www.example.com`, `a.b.example.com`) but must NOT match another zone
//! such as `xxxexample.com`. To turn this longest-suffix problem into the
//! longest-prefix match the crit-bit tree offers, a zone or query name is
//! transformed before use:
//!
//! 1. strip the trailing dot, if any
//! 2. convert to lower case (256-byte table, no per-char branching)
//! 3. reverse the byte order
//! 4. append a dot sentinel
//!
//! `example.com` becomes `moc.elpmaxe.`; `xxxexample.com` becomes
//! `moc.elpmaxexxx.`, which is not prefixed by `moc.elpmaxe.` because the
//! sentinel dot forces a label boundary.
//!
//! Like [`CritbitTree`], the trie does no internal locking.

use super::critbit::CritbitTree;

/// Case-folding table over raw bytes; only ASCII letters are mapped.
static KEY_FOLD_TABLE: [u8; 256] = build_fold_table();

const fn build_fold_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let c = i as u8;
        table[i] = if c.is_ascii_uppercase() {
            c - b'A' + b'a'
        } else {
            c
        };
        i += 1;
    }
    table
}

/// Transform a domain name into a trie lookup key.
///
/// The input is the dotted form as raw bytes; it does not need to be
/// normalized (`www.Example.COM.` is accepted), and label bytes outside
/// ASCII pass through the fold table unchanged.
#[must_use]
pub fn trie_key(name: &[u8]) -> Vec<u8> {
    let name = name.strip_suffix(b".").unwrap_or(name);
    let len = name.len();

    let mut key = vec![0u8; len + 1];
    for (i, &c) in name.iter().enumerate() {
        key[len - i - 1] = KEY_FOLD_TABLE[c as usize];
    }
    key[len] = b'.';
    key
}

/// Stored per zone: the name as originally supplied (for export) plus the
/// caller's value.
struct ZoneEntry<V> {
    name: String,
    value: V,
}

/// Zone table with longest-suffix matching.
///
/// Zones are added by their configured text names; lookups take the
/// dotted raw-byte form a query name arrives in.
///
/// # Example
///
/// ```
/// use kexuedns::util::dnstrie::DnsTrie;
///
/// let mut trie = DnsTrie::new();
/// trie.add_zone("example.com", 1);
/// trie.add_zone("com", 2);
///
/// assert_eq!(trie.match_name(b"www.Example.COM").map(|(_, v)| *v), Some(1));
/// assert_eq!(trie.match_name(b"other.com").map(|(_, v)| *v), Some(2));
/// assert_eq!(trie.match_name(b"xxxexample.com").map(|(_, v)| *v), Some(2));
/// assert_eq!(trie.match_name(b"example.net"), None);
/// ```
pub struct DnsTrie<V> {
    tree: CritbitTree<ZoneEntry<V>>,
}

impl<V> Default for DnsTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> DnsTrie<V> {
    /// Create an empty zone table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: CritbitTree::new(),
        }
    }

    /// Number of zones in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the table holds no zones.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Add or replace a zone; the name is stored as supplied for export.
    pub fn add_zone(&mut self, name: &str, value: V) {
        self.tree.set(
            &trie_key(name.as_bytes()),
            ZoneEntry {
                name: name.to_string(),
                value,
            },
        );
    }

    /// Whether the exact zone is present (subdomains do not count).
    #[must_use]
    pub fn has_zone(&self, name: &str) -> bool {
        self.tree.get(&trie_key(name.as_bytes())).is_some()
    }

    /// Value of the exact zone, if present.
    #[must_use]
    pub fn get_zone(&self, name: &str) -> Option<&V> {
        self.tree.get(&trie_key(name.as_bytes())).map(|e| &e.value)
    }

    /// Remove a zone, returning its value.
    pub fn remove_zone(&mut self, name: &str) -> Option<V> {
        self.tree.remove(&trie_key(name.as_bytes())).map(|e| e.value)
    }

    /// Find the longest zone that `name` equals or is a subdomain of.
    ///
    /// Returns the zone name as originally added, plus its value.
    #[must_use]
    pub fn match_name(&self, name: &[u8]) -> Option<(&str, &V)> {
        self.tree
            .longest_prefix(&trie_key(name))
            .map(|(_, e)| (e.name.as_str(), &e.value))
    }

    /// All zones as `(original name, value)` pairs.
    #[must_use]
    pub fn export(&self) -> Vec<(&str, &V)> {
        let mut zones = Vec::with_capacity(self.tree.len());
        self.tree.walk(|_, e| {
            zones.push((e.name.as_str(), &e.value));
            true
        });
        zones
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Key Transformation
    // ========================================================================

    #[test]
    fn test_trie_key_basic() {
        assert_eq!(trie_key(b"example.com"), b"moc.elpmaxe.");
        assert_eq!(trie_key(b"example.com."), b"moc.elpmaxe.");
    }

    #[test]
    fn test_trie_key_case_folding() {
        assert_eq!(trie_key(b"www.Example.COM"), b"moc.elpmaxe.www.");
    }

    #[test]
    fn test_trie_key_root() {
        assert_eq!(trie_key(b"."), b".");
        assert_eq!(trie_key(b""), b".");
    }

    // ========================================================================
    // Zone Operations
    // ========================================================================

    #[test]
    fn test_add_get_remove() {
        let mut trie = DnsTrie::new();
        trie.add_zone("example.com", 1);

        assert!(trie.has_zone("example.com"));
        assert!(trie.has_zone("Example.Com."));
        assert!(!trie.has_zone("www.example.com"));
        assert_eq!(trie.get_zone("example.com"), Some(&1));

        assert_eq!(trie.remove_zone("EXAMPLE.COM"), Some(1));
        assert!(trie.is_empty());
    }

    #[test]
    fn test_add_zone_replaces() {
        let mut trie = DnsTrie::new();
        trie.add_zone("example.com", 1);
        trie.add_zone("Example.COM", 2);
        assert_eq!(trie.len(), 1);
        assert_eq!(trie.get_zone("example.com"), Some(&2));
    }

    // ========================================================================
    // Longest-Suffix Match
    // ========================================================================

    #[test]
    fn test_match_longest_suffix() {
        let mut trie = DnsTrie::new();
        trie.add_zone("com", 1);
        trie.add_zone("example.com", 2);
        trie.add_zone("net", 3);

        assert_eq!(trie.match_name(b"foo.example.com").map(|(_, v)| *v), Some(2));
        assert_eq!(trie.match_name(b"example.com").map(|(_, v)| *v), Some(2));
        assert_eq!(trie.match_name(b"foo.bar.com").map(|(_, v)| *v), Some(1));
        assert_eq!(trie.match_name(b"anything.net").map(|(_, v)| *v), Some(3));
        assert_eq!(trie.match_name(b"anything.org"), None);
    }

    #[test]
    fn test_match_rejects_label_straddle() {
        let mut trie = DnsTrie::new();
        trie.add_zone("example.com", 1);

        // Shares a byte suffix but not a label boundary.
        assert_eq!(trie.match_name(b"xxxexample.com"), None);
        assert_eq!(trie.match_name(b"xexample.com."), None);
    }

    #[test]
    fn test_match_is_case_insensitive() {
        let mut trie = DnsTrie::new();
        trie.add_zone("Example.COM", 7);
        assert_eq!(trie.match_name(b"WWW.EXAMPLE.com.").map(|(_, v)| *v), Some(7));
    }

    #[test]
    fn test_match_returns_original_name() {
        let mut trie = DnsTrie::new();
        trie.add_zone("Example.COM", ());
        let (name, ()) = trie.match_name(b"www.example.com").unwrap();
        assert_eq!(name, "Example.COM");
    }

    // ========================================================================
    // Export
    // ========================================================================

    #[test]
    fn test_export_original_names() {
        let mut trie = DnsTrie::new();
        trie.add_zone("Example.COM", 1);
        trie.add_zone("net", 2);

        let mut zones = trie.export();
        zones.sort_by_key(|(name, _)| name.to_string());
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].0, "Example.COM");
        assert_eq!(zones[1].0, "net");
    }
}
