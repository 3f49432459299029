use hickory_proto::op::Message;
use hickory_proto::rr::RData;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::matcher::normalize_name;

/// The CNAME graph of a single response: source → target links plus every
/// name that appears on either side, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct CnameChain {
    links: FxHashMap<String, String>,
    names: Vec<String>,
    seen: FxHashSet<String>,
}

impl CnameChain {
    pub fn from_response(resp: &Message) -> Self {
        let mut chain = Self::default();
        for record in resp.answers() {
            if let Some(RData::CNAME(target)) = record.data() {
                let source = normalize_name(&record.name().to_utf8());
                let target = normalize_name(&target.0.to_utf8());
                chain.links.insert(source.clone(), target.clone());
                chain.push_name(source);
                chain.push_name(target);
            }
        }
        chain
    }

    fn push_name(&mut self, name: String) {
        if self.seen.insert(name.clone()) {
            self.names.push(name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.seen.contains(&normalize_name(name))
    }

    pub fn target_of(&self, name: &str) -> Option<&str> {
        self.links.get(&normalize_name(name)).map(String::as_str)
    }

    /// Follow links from `source` until a name has no outgoing link or has
    /// already been visited. The revisit check makes traversal finite even
    /// for cyclic responses.
    pub fn trace(&self, source: &str) -> Vec<String> {
        let source = normalize_name(source);
        if !self.seen.contains(&source) {
            return Vec::new();
        }

        let mut visited = FxHashSet::default();
        let mut path = Vec::new();
        let mut current = source;
        loop {
            if !visited.insert(current.clone()) {
                break;
            }
            path.push(current.clone());
            match self.target_of(&current) {
                Some(next) if next != current => current = next.to_string(),
                _ => break,
            }
        }
        path
    }

    /// Every name in the graph, in the order records introduced them.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
