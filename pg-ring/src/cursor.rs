//! Cyclic traversal over the live members of a ring.
//!
//! A ring is never materialised as a circular structure. Traversal is two
//! range scans over a sorted slice: the tail after (or from) a position,
//! then the head from the smallest member.

/// A live member as seen through one ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveMember {
    pub name: String,
    pub namespace: String,
    /// Id of the membership row, the target of subscriber pointers.
    pub membership_id: i64,
}

impl LiveMember {
    /// Ring position: name first, namespace to order members sharing a name.
    fn key(&self) -> (&str, &str) {
        (&self.name, &self.namespace)
    }
}

/// Live members of one ring, sorted by `(name, namespace)` with byte-wise
/// ordering.
///
/// Members of different namespaces may share a name; each still holds its
/// own position.
#[derive(Debug, Clone, Default)]
pub struct LiveSet {
    members: Vec<LiveMember>,
}

impl LiveSet {
    pub fn new(mut members: Vec<LiveMember>) -> Self {
        members.sort_by(|a, b| a.key().cmp(&b.key()));
        Self { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn first(&self) -> Option<&LiveMember> {
        self.members.first()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.name.as_str())
    }

    /// Resolve a subscriber pointer to the member it designates.
    ///
    /// A pointer to a membership that is no longer live resolves to `None`.
    pub fn resolve(&self, membership_id: Option<i64>) -> Option<&LiveMember> {
        let id = membership_id?;
        self.members.iter().find(|m| m.membership_id == id)
    }

    /// Members strictly after `current`, followed by every member from the
    /// start. No position starts before the smallest member.
    pub fn cycle_after<'a>(
        &'a self,
        current: Option<&LiveMember>,
    ) -> impl Iterator<Item = &'a LiveMember> {
        let start = match current {
            Some(current) => self.members.partition_point(|m| m.key() <= current.key()),
            None => 0,
        };
        self.members[start..].iter().chain(self.members.iter())
    }

    /// Every member exactly once, starting at `position` (inclusive) and wrapping.
    pub fn cycle_from<'a>(&'a self, position: &LiveMember) -> impl Iterator<Item = &'a LiveMember> {
        let start = self.members.partition_point(|m| m.key() < position.key());
        self.members[start..]
            .iter()
            .chain(self.members[..start].iter())
    }

    /// The member `skip` steps past `current`, with `skip` taken modulo the set size.
    ///
    /// `current = None` starts before the smallest member, so `skip = 0`
    /// yields the first member.
    pub fn advance(&self, current: Option<&LiveMember>, skip: u64) -> Option<&LiveMember> {
        if self.members.is_empty() {
            return None;
        }
        let steps = (skip % self.members.len() as u64) as usize;
        self.cycle_after(current).nth(steps)
    }

    /// Up to `limit` distinct members starting at `position`, or at the first
    /// member when there is no position.
    pub fn window(&self, position: Option<&LiveMember>, limit: usize) -> Vec<&LiveMember> {
        let take = limit.min(self.members.len());
        match position {
            Some(position) => self.cycle_from(position).take(take).collect(),
            None => self.members.iter().take(take).collect(),
        }
    }
}
