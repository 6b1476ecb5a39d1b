//! Subscription index: a trie of topic filters for fast topic matching.
//!
//! Supports MQTT wildcards:
//! - `+` matches exactly one topic level
//! - `#` matches any number of remaining topic levels (must be last)
//!
//! A `#` never gets a node of its own. It sets a flag on its parent, and a
//! flagged node matches whatever is left of the topic, including nothing.

use std::collections::HashMap;
use std::fmt;

use crate::error::Result;
use crate::topic;

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    match_any: Option<Box<Node>>, // + wildcard
    match_all: bool,              // filter "<path>/#" ends here
    terminal: bool,               // filter "<path>" ends here
}

impl Node {
    fn is_empty(&self) -> bool {
        !self.terminal && !self.match_all && self.match_any.is_none() && self.children.is_empty()
    }

    fn child(&self, level: &str) -> Option<&Node> {
        match level {
            "+" => self.match_any.as_deref(),
            _ => self.children.get(level),
        }
    }

    fn child_mut(&mut self, level: &str) -> Option<&mut Node> {
        match level {
            "+" => self.match_any.as_deref_mut(),
            _ => self.children.get_mut(level),
        }
    }

    fn remove_child(&mut self, level: &str) {
        match level {
            "+" => self.match_any = None,
            _ => {
                self.children.remove(level);
            }
        }
    }

    /// Whether this node holds nothing but the child reached through `level`.
    fn only_holds(&self, level: &str) -> bool {
        if self.terminal || self.match_all {
            return false;
        }
        match level {
            "+" => self.children.is_empty(),
            _ => self.match_any.is_none() && self.children.len() == 1,
        }
    }

    /// Filters can be as deep as a packet allows, so matching walks an
    /// explicit stack of `(node, rest, at_root)` instead of recursing.
    /// `rest` is the unmatched tail of the topic, `None` once every level
    /// has been consumed.
    fn matches(&self, topic: &str) -> bool {
        let mut stack = vec![(self, Some(topic), true)];
        while let Some((node, rest, at_root)) = stack.pop() {
            let Some(path) = rest else {
                if node.terminal || node.match_all {
                    return true;
                }
                continue;
            };
            let (first, subseq) = split_level(path);

            // $ topics only match filters that spell out the $ level.
            let hidden = at_root && first.starts_with('$');
            if node.match_all && !hidden {
                return true;
            }

            // Popped in reverse: the exact child is tried before `+`.
            if let Some(any) = node.match_any.as_deref().filter(|_| !hidden) {
                stack.push((any, subseq, false));
            }
            if let Some(child) = node.children.get(first) {
                stack.push((child, subseq, false));
            }
        }
        false
    }
}

impl Drop for Node {
    // Tear down iteratively; the default drop recurses once per level.
    fn drop(&mut self) {
        let mut pending: Vec<Node> = self.children.drain().map(|(_, n)| n).collect();
        pending.extend(self.match_any.take().map(|n| *n));
        while let Some(mut node) = pending.pop() {
            pending.extend(node.children.drain().map(|(_, n)| n));
            pending.extend(node.match_any.take().map(|n| *n));
        }
    }
}

fn split_level(path: &str) -> (&str, Option<&str>) {
    match path.find('/') {
        None => (path, None),
        Some(idx) => (&path[..idx], Some(&path[idx + 1..])),
    }
}

/// Set of topic filters held by one session.
///
/// Not synchronized; sessions keep it behind a lock because fan-out from
/// other sessions reads it while the owner's SUBSCRIBE handling writes it.
#[derive(Default)]
pub struct SubscriptionIndex {
    root: Node,
    len: usize,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter. Returns `false` if it was already present.
    pub fn subscribe(&mut self, filter: &str) -> Result<bool> {
        topic::validate_filter(filter)?;

        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();
        while let Some(level) = levels.next() {
            match level {
                // Validation guarantees this is the last level.
                "#" => {
                    let added = !std::mem::replace(&mut node.match_all, true);
                    self.len += added as usize;
                    return Ok(added);
                }
                "+" => node = &mut **node.match_any.get_or_insert_with(Default::default),
                _ => node = node.children.entry(level.to_string()).or_default(),
            }
        }

        let added = !std::mem::replace(&mut node.terminal, true);
        self.len += added as usize;
        Ok(added)
    }

    /// Remove a filter, pruning nodes left empty. Returns `false` if the
    /// filter was not present.
    pub fn unsubscribe(&mut self, filter: &str) -> bool {
        let mut levels: Vec<&str> = filter.split('/').collect();
        let multi = levels.last() == Some(&"#");
        if multi {
            levels.pop();
        }

        // Find the node the filter ends at. `cut` is the deepest node on
        // the path that holds something besides the path itself; everything
        // below it goes if the filter was all the last node held.
        let mut node = &self.root;
        let mut cut = 0;
        for (depth, &level) in levels.iter().enumerate() {
            if depth > 0 && !node.only_holds(level) {
                cut = depth;
            }
            let Some(child) = node.child(level) else {
                return false;
            };
            node = child;
        }
        let others = node.match_any.is_some() || !node.children.is_empty();
        let (present, empty_after) = if multi {
            (node.match_all, !others && !node.terminal)
        } else {
            (node.terminal, !others && !node.match_all)
        };
        if !present {
            return false;
        }
        self.len -= 1;

        if empty_after && !levels.is_empty() {
            let mut parent = &mut self.root;
            for &level in &levels[..cut] {
                match parent.child_mut(level) {
                    Some(child) => parent = child,
                    None => return true,
                }
            }
            parent.remove_child(levels[cut]);
            return true;
        }

        let mut node = &mut self.root;
        for &level in &levels {
            match node.child_mut(level) {
                Some(child) => node = child,
                None => return true,
            }
        }
        if multi {
            node.match_all = false;
        } else {
            node.terminal = false;
        }
        true
    }

    /// Check whether any filter matches `topic`.
    pub fn matches(&self, topic: &str) -> bool {
        !topic.is_empty() && self.root.matches(topic)
    }

    /// Number of distinct filters.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for SubscriptionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionIndex")
            .field("filters", &self.len)
            .field("top_level", &self.root.children.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(filters: &[&str]) -> SubscriptionIndex {
        let mut idx = SubscriptionIndex::new();
        for f in filters {
            idx.subscribe(f).unwrap();
        }
        idx
    }

    #[test]
    fn test_exact_match() {
        let idx = index(&["device/gear-001/state"]);
        assert!(idx.matches("device/gear-001/state"));
        assert!(!idx.matches("device/gear-002/state"));
        assert!(!idx.matches("device/gear-001"));
        assert!(!idx.matches("device/gear-001/state/extra"));
    }

    #[test]
    fn test_single_level_wildcard() {
        let idx = index(&["device/+/state"]);
        assert!(idx.matches("device/gear-001/state"));
        assert!(idx.matches("device/abc/state"));
        assert!(!idx.matches("device/state")); // Missing middle level
        assert!(!idx.matches("device/a/b/state")); // Too many levels
    }

    #[test]
    fn test_multi_level_wildcard() {
        let idx = index(&["device/#"]);
        assert!(idx.matches("device"));
        assert!(idx.matches("device/gear-001"));
        assert!(idx.matches("device/gear-001/state/value"));
        assert!(!idx.matches("other/gear-001"));
    }

    #[test]
    fn test_multi_level_wildcard_must_be_last() {
        let mut idx = SubscriptionIndex::new();
        assert!(idx.subscribe("device/#/state").is_err());
        assert!(idx.is_empty());
    }

    #[test]
    fn test_prefix_filter_does_not_match_deeper_topic() {
        let idx = index(&["a"]);
        assert!(!idx.matches("a/b"));
    }

    #[test]
    fn test_literal_branch_does_not_hide_wildcard() {
        let idx = index(&["a/b/c", "a/+/d"]);
        assert!(idx.matches("a/b/d"));
        assert!(idx.matches("a/b/c"));
        assert!(!idx.matches("a/b/e"));
    }

    #[test]
    fn test_dollar_topics() {
        let idx = index(&["#", "+/broker"]);
        assert!(!idx.matches("$SYS/broker"));
        assert!(idx.matches("normal/broker"));

        let idx = index(&["$SYS/#"]);
        assert!(idx.matches("$SYS/broker/load"));
    }

    #[test]
    fn test_subscribe_idempotent() {
        let mut idx = SubscriptionIndex::new();
        assert!(idx.subscribe("a/+").unwrap());
        assert!(!idx.subscribe("a/+").unwrap());
        assert_eq!(idx.len(), 1);
        assert!(idx.matches("a/x"));

        // A single unsubscribe undoes a repeated subscribe.
        assert!(idx.unsubscribe("a/+"));
        assert!(!idx.matches("a/x"));
    }

    #[test]
    fn test_unsubscribe_prunes() {
        let mut idx = index(&["a/b/c", "a/b/#", "a/+"]);
        assert_eq!(idx.len(), 3);

        assert!(idx.unsubscribe("a/b/#"));
        assert!(!idx.matches("a/b/x"));
        assert!(idx.matches("a/b/c"));
        assert!(idx.matches("a/b"));

        assert!(idx.unsubscribe("a/b/c"));
        assert!(idx.unsubscribe("a/+"));
        assert!(!idx.unsubscribe("a/+"));
        assert!(!idx.unsubscribe("never/subscribed"));
        assert!(idx.is_empty());
        assert!(idx.root.is_empty());
    }

    #[test]
    fn test_unsubscribe_keeps_shared_prefix() {
        let mut idx = index(&["a/b/c/d", "a/b", "a/+/c"]);

        assert!(idx.unsubscribe("a/b/c/d"));
        assert!(idx.matches("a/b"));
        assert!(idx.matches("a/x/c"));
        assert!(!idx.matches("a/b/c/d"));

        assert!(idx.unsubscribe("a/+/c"));
        assert!(idx.matches("a/b"));
        assert!(idx.unsubscribe("a/b"));
        assert!(idx.root.is_empty());

        let mut idx = index(&["#"]);
        assert!(idx.unsubscribe("#"));
        assert!(!idx.matches("x"));
        assert!(idx.root.is_empty());
    }

    #[test]
    fn test_deepest_filter_on_small_stack() {
        // 32768 one-byte levels: the longest filter a SUBSCRIBE can carry.
        let deep = vec!["a"; 32768].join("/");
        assert_eq!(deep.len(), 65535);
        let wild = format!("{}/+", vec!["a"; 32767].join("/"));

        let worker = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || {
                let mut idx = SubscriptionIndex::new();
                assert!(idx.subscribe(&deep).unwrap());
                assert!(idx.subscribe(&wild).unwrap());
                assert!(idx.matches(&deep));
                assert!(!idx.matches(&format!("{}/a", deep)));

                assert!(idx.unsubscribe(&deep));
                assert!(idx.matches(&deep)); // still matched through `+`
                drop(idx);

                let mut idx = SubscriptionIndex::new();
                idx.subscribe(&deep).unwrap();
                // Dropped with the deep path still in place.
            })
            .unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_agrees_with_linear_matcher() {
        let topics = [
            "sport/tennis/player1",
            "sport/tennis/player1/ranking",
            "sport",
            "sport/",
            "/finance",
            "finance",
            "foo",
            "foo/bar",
            "$SYS/broker/load",
            "a/b/c/d",
        ];
        let filters = [
            "sport/#",
            "sport/#/ranking",
            "sport/tennis/+",
            "sport/+",
            "+/+",
            "+",
            "/+",
            "#",
            "foo/#",
            "foo",
            "$SYS/#",
            "+/broker/load",
            "a/+/c/#",
            "a/b/c/d/#",
        ];

        for f in filters {
            let mut idx = SubscriptionIndex::new();
            let valid = idx.subscribe(f).is_ok();
            for t in topics {
                let expected = topic::matches(t, f);
                assert_eq!(
                    idx.matches(t),
                    expected,
                    "topic {:?} filter {:?} (valid filter: {})",
                    t,
                    f,
                    valid
                );
            }
        }
    }
}
