//! Tree topology geometry for the Flux overlay network.
//!
//! A [`Topology`] is a pure, side-effect-free object parametrized by a
//! scheme and a size: given those two things alone it can answer "who is my
//! parent", "which of my children routes toward rank N", and similar
//! questions without touching a socket or the filesystem. Built-in schemes:
//! `flat`, `kary:K` (`kary:0` is an alias for flat), `binomial`, `mincrit:K`,
//! and `custom` (driven by a caller-supplied host/parent list).

use std::any::Any;
use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("size must be positive, got {0}")]
    InvalidSize(i64),
    #[error("unknown topology scheme '{0}'")]
    UnknownScheme(String),
    #[error("custom topology has {hosts} hosts but size is {size}")]
    SizeMismatch { hosts: usize, size: usize },
    #[error("custom topology cannot give rank 0 a parent")]
    ParentEdgeToRoot,
    #[error("host '{0}' names itself as its own parent")]
    SelfParent(String),
    #[error("custom topology contains a cycle among parent edges")]
    Cycle,
    #[error("custom topology references unknown host '{0}'")]
    UnknownHost(String),
    #[error("rank {0} is out of range")]
    UnknownRank(u32),
}

/// A host entry for the `custom` scheme: a name and the name of its parent,
/// or `None` for the root (must be the entry at index 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomHost {
    pub hostname: String,
    pub parent_hostname: Option<String>,
}

/// A parsed topology scheme, ready to build a [`Topology`] against a size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheme {
    Flat,
    Kary(u32),
    Binomial,
    Mincrit(u32),
    Custom(Vec<CustomHost>),
}

impl Scheme {
    /// Parse a built-in scheme URI: `"flat"`, `"kary:K"`, `"binomial"`,
    /// `"mincrit:K"`. `tbon.fanout=K` is aliased to `kary:K` by the config
    /// layer before it reaches here. `custom` is not parseable from a bare
    /// string since it needs a host list; construct `Scheme::Custom`
    /// directly instead.
    pub fn parse(uri: &str) -> Result<Self, TopologyError> {
        if uri == "flat" {
            return Ok(Scheme::Flat);
        }
        if uri == "binomial" {
            return Ok(Scheme::Binomial);
        }
        if let Some(k) = uri.strip_prefix("kary:") {
            let k: u32 = k
                .parse()
                .map_err(|_| TopologyError::UnknownScheme(uri.to_string()))?;
            return Ok(Scheme::Kary(k));
        }
        if let Some(k) = uri.strip_prefix("mincrit:") {
            let k: u32 = k
                .parse()
                .map_err(|_| TopologyError::UnknownScheme(uri.to_string()))?;
            return Ok(Scheme::Mincrit(k));
        }
        Err(TopologyError::UnknownScheme(uri.to_string()))
    }
}

fn lowbit(i: u32) -> u32 {
    i & i.wrapping_neg()
}

fn build_parent_array(scheme: &Scheme, size: usize) -> Result<Vec<i32>, TopologyError> {
    let mut parent = vec![-1i32; size];

    match scheme {
        Scheme::Flat => {
            for r in 1..size {
                parent[r] = 0;
            }
        }
        Scheme::Kary(0) => {
            for r in 1..size {
                parent[r] = 0;
            }
        }
        Scheme::Kary(k) => {
            let k = *k as usize;
            for r in 1..size {
                parent[r] = ((r - 1) / k) as i32;
            }
        }
        Scheme::Binomial => {
            for r in 1..size {
                parent[r] = (r as u32 - lowbit(r as u32)) as i32;
            }
        }
        Scheme::Mincrit(k) => {
            let k = *k as usize;
            let internal_count = (k + 1).min(size);
            for r in 1..internal_count {
                parent[r] = 0;
            }
            for r in internal_count..size {
                let slot = (r - internal_count) % internal_count;
                parent[r] = slot as i32;
            }
        }
        Scheme::Custom(hosts) => {
            if hosts.len() != size {
                return Err(TopologyError::SizeMismatch {
                    hosts: hosts.len(),
                    size,
                });
            }
            let mut index_of: HashMap<&str, usize> = HashMap::new();
            for (i, h) in hosts.iter().enumerate() {
                index_of.insert(h.hostname.as_str(), i);
            }
            for (i, h) in hosts.iter().enumerate() {
                match (&h.parent_hostname, i) {
                    (Some(_), 0) => return Err(TopologyError::ParentEdgeToRoot),
                    (None, 0) => parent[0] = -1,
                    (None, _) => {
                        return Err(TopologyError::UnknownHost(format!(
                            "{} has no parent and is not rank 0",
                            h.hostname
                        )))
                    }
                    (Some(p), _) => {
                        if p == &h.hostname {
                            return Err(TopologyError::SelfParent(h.hostname.clone()));
                        }
                        let pi = *index_of
                            .get(p.as_str())
                            .ok_or_else(|| TopologyError::UnknownHost(p.clone()))?;
                        parent[i] = pi as i32;
                    }
                }
            }
            // cycle detection: walk each node's ancestor chain; it must
            // reach rank 0 within `size` hops.
            for start in 0..size {
                let mut cur = start;
                let mut hops = 0;
                while parent[cur] >= 0 {
                    cur = parent[cur] as usize;
                    hops += 1;
                    if hops > size {
                        return Err(TopologyError::Cycle);
                    }
                }
                if cur != 0 {
                    return Err(TopologyError::Cycle);
                }
            }
        }
    }

    Ok(parent)
}

fn build_children_array(parent: &[i32]) -> Vec<Vec<u32>> {
    let mut children = vec![Vec::new(); parent.len()];
    for (r, p) in parent.iter().enumerate() {
        if *p >= 0 {
            children[*p as usize].push(r as u32);
        }
    }
    for c in &mut children {
        c.sort_unstable();
    }
    children
}

/// A tree topology built against a fixed size, with a mutable "querying
/// perspective" rank set via [`Topology::set_rank`].
pub struct Topology {
    scheme: Scheme,
    size: usize,
    parent: Vec<i32>,
    children: Vec<Vec<u32>>,
    rank: Option<u32>,
    aux: HashMap<(u32, String), Box<dyn Any + Send>>,
}

impl Topology {
    pub fn build(scheme: Scheme, size: i64) -> Result<Self, TopologyError> {
        if size <= 0 {
            return Err(TopologyError::InvalidSize(size));
        }
        let size = size as usize;
        let parent = build_parent_array(&scheme, size)?;
        let children = build_children_array(&parent);
        Ok(Self {
            scheme,
            size,
            parent,
            children,
            rank: None,
            aux: HashMap::new(),
        })
    }

    /// Build a built-in topology from its URI (`flat`, `kary:K`,
    /// `binomial`, `mincrit:K`) plus a size.
    pub fn from_uri(uri: &str, size: i64) -> Result<Self, TopologyError> {
        Self::build(Scheme::parse(uri)?, size)
    }

    /// Build a `custom` topology from a host/parent list. `size` must equal
    /// `hosts.len()`.
    pub fn from_custom(hosts: Vec<CustomHost>, size: i64) -> Result<Self, TopologyError> {
        if size <= 0 {
            return Err(TopologyError::InvalidSize(size));
        }
        Self::build(Scheme::Custom(hosts), size)
    }

    fn check_rank(&self, r: u32) -> Result<(), TopologyError> {
        if (r as usize) < self.size {
            Ok(())
        } else {
            Err(TopologyError::UnknownRank(r))
        }
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// Set the rank this topology answers single-argument queries from
    /// (`get_rank`, `get_parent`, `get_child_ranks`, `get_level`,
    /// `get_descendant_count`).
    pub fn set_rank(&mut self, r: u32) -> Result<(), TopologyError> {
        self.check_rank(r)?;
        self.rank = Some(r);
        Ok(())
    }

    pub fn get_rank(&self) -> Option<u32> {
        self.rank
    }

    pub fn get_size(&self) -> usize {
        self.size
    }

    /// Parent of the rank established by `set_rank`, or `None` at rank 0.
    pub fn get_parent(&self) -> Option<u32> {
        let r = self.rank?;
        self.get_parent_of(r)
    }

    pub fn get_parent_of(&self, r: u32) -> Option<u32> {
        if (r as usize) >= self.size {
            return None;
        }
        let p = self.parent[r as usize];
        (p >= 0).then_some(p as u32)
    }

    pub fn get_child_ranks(&self) -> Vec<u32> {
        match self.rank {
            Some(r) => self.get_child_ranks_of(r),
            None => Vec::new(),
        }
    }

    pub fn get_child_ranks_of(&self, r: u32) -> Vec<u32> {
        self.children
            .get(r as usize)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_level(&self) -> u32 {
        self.rank.map(|r| self.get_level_of(r)).unwrap_or(0)
    }

    pub fn get_level_of(&self, r: u32) -> u32 {
        let mut level = 0;
        let mut cur = r;
        while let Some(p) = self.get_parent_of(cur) {
            level += 1;
            cur = p;
        }
        level
    }

    pub fn get_maxlevel(&self) -> u32 {
        (0..self.size as u32)
            .map(|r| self.get_level_of(r))
            .max()
            .unwrap_or(0)
    }

    /// Number of descendants (not counting the rank itself) of the
    /// currently set rank.
    pub fn get_descendant_count(&self) -> usize {
        self.rank
            .map(|r| self.get_descendant_count_at(r))
            .unwrap_or(0)
    }

    pub fn get_descendant_count_at(&self, r: u32) -> usize {
        let mut count = 0;
        let mut stack: Vec<u32> = self.get_child_ranks_of(r);
        while let Some(n) = stack.pop() {
            count += 1;
            stack.extend(self.get_child_ranks_of(n));
        }
        count
    }

    /// The immediate child of `r` (the currently set rank) whose subtree
    /// contains `dest_rank`, or `None` if `dest_rank` is not a descendant
    /// reachable through any child.
    pub fn get_child_route(&self, dest_rank: u32) -> Option<u32> {
        let r = self.rank?;
        self.get_child_route_from(r, dest_rank)
    }

    pub fn get_child_route_from(&self, r: u32, dest_rank: u32) -> Option<u32> {
        for child in self.get_child_ranks_of(r) {
            if child == dest_rank {
                return Some(child);
            }
            let mut stack = self.get_child_ranks_of(child);
            while let Some(n) = stack.pop() {
                if n == dest_rank {
                    return Some(child);
                }
                stack.extend(self.get_child_ranks_of(n));
            }
        }
        None
    }

    /// All ranks with at least one child.
    pub fn get_internal_ranks(&self) -> Vec<u32> {
        (0..self.size as u32)
            .filter(|r| !self.get_child_ranks_of(*r).is_empty())
            .collect()
    }

    pub fn get_json_subtree_at(&self, r: u32) -> Result<serde_json::Value, TopologyError> {
        self.check_rank(r)?;
        Ok(self.subtree_json(r))
    }

    fn subtree_json(&self, r: u32) -> serde_json::Value {
        let children: Vec<serde_json::Value> = self
            .get_child_ranks_of(r)
            .into_iter()
            .map(|c| self.subtree_json(c))
            .collect();
        serde_json::json!({
            "rank": r,
            "size": 1 + self.get_descendant_count_at(r),
            "children": children,
        })
    }

    /// Attach an opaque value to `(rank, name)`. Overwrites and drops any
    /// previous value at that key.
    pub fn rank_aux_set<T: Any + Send>(&mut self, rank: u32, name: &str, value: T) {
        self.aux.insert((rank, name.to_string()), Box::new(value));
    }

    pub fn rank_aux_get<T: Any + Send>(&self, rank: u32, name: &str) -> Option<&T> {
        self.aux
            .get(&(rank, name.to_string()))
            .and_then(|b| b.downcast_ref::<T>())
    }

    pub fn rank_aux_clear(&mut self, rank: u32, name: &str) {
        self.aux.remove(&(rank, name.to_string()));
    }
}
