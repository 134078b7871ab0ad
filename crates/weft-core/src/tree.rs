//! Generic causal tree: a weave, a Lamport clock and a reducer.
//!
//! [`CausalTree`] owns one replica's weave and turns it into an application
//! value through a pluggable [`Reducer`]. The value is computed lazily and
//! memoized until the next mutation.
//!
//! # Notifications
//!
//! Collaborators observe the tree through [`CausalTree::subscribe`], which
//! hands out a typed channel receiving [`TreeEvent`]s:
//!
//! - `AtomsAdded` fires once per local mutation or imported batch, carrying
//!   the new atoms in causal order. It is never empty.
//! - `AtomsArchived` fires once per garbage-collection pass that removed
//!   atoms, in removal order.
//!
//! Inside [`CausalTree::batch`] both notifications and garbage collection are
//! deferred to the end of the outermost batch.

use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, Sender};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::atom::{Atom, AtomFactory, AtomId, SiteInfo};
use crate::config::TreeOptions;
use crate::error::TreeError;
use crate::weave::{Weave, WeaveVersion};

/// Turns a weave into an application value.
pub trait Reducer<O> {
    type Value;

    /// Materialize the value of `weave`. Must be a pure function of the
    /// atoms present, so replicas holding the same atoms agree.
    fn eval(&self, weave: &Weave<O>) -> Self::Value;

    /// Roots of subtrees that can no longer affect any materialization.
    fn collect_garbage(&self, weave: &Weave<O>) -> Vec<AtomId> {
        let _ = weave;
        Vec::new()
    }
}

/// Change notification emitted to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent<O> {
    AtomsAdded(Vec<Atom<O>>),
    AtomsArchived(Vec<Atom<O>>),
}

/// Persisted form of a tree, exchanged with storage and transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "O: Deserialize<'de>"))]
pub struct StoredCausalTree<O> {
    pub site: SiteInfo,
    #[serde(default)]
    pub known_sites: Option<Vec<SiteInfo>>,
    #[serde(default)]
    pub weave: Option<Vec<Atom<O>>>,
}

impl<O: Serialize> StoredCausalTree<O> {
    /// Encode as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::Encode`] if an op fails to serialize.
    pub fn to_json(&self) -> Result<String, TreeError> {
        serde_json::to_string_pretty(self).map_err(TreeError::Encode)
    }
}

impl<O: DeserializeOwned> StoredCausalTree<O> {
    /// Decode from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::Decode`] for malformed JSON or unknown ops.
    pub fn from_json(json: &str) -> Result<Self, TreeError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// One replica of a causal tree.
#[derive(Debug)]
pub struct CausalTree<O, R: Reducer<O>> {
    site: SiteInfo,
    known_sites: Vec<SiteInfo>,
    weave: Weave<O>,
    factory: AtomFactory,
    reducer: R,
    memo: Option<R::Value>,
    subscribers: Vec<Sender<TreeEvent<O>>>,
    batch_depth: usize,
    batch_added: Vec<Atom<O>>,
    options: TreeOptions,
}

impl<O: Clone, R: Reducer<O>> CausalTree<O, R> {
    /// Create an empty replica for `site`.
    #[must_use]
    pub fn new(site: SiteInfo, reducer: R, options: TreeOptions) -> Self {
        let mut weave = Weave::new();
        weave.set_buffer_orphans(options.buffer_orphans);
        Self {
            site,
            known_sites: vec![site],
            weave,
            factory: AtomFactory::new(site.id, 0),
            reducer,
            memo: None,
            subscribers: Vec::new(),
            batch_depth: 0,
            batch_added: Vec::new(),
            options,
        }
    }

    /// Rebuild a replica from its stored form.
    ///
    /// The clock resumes past the newest timestamp in the stored weave.
    #[must_use]
    pub fn from_stored(stored: StoredCausalTree<O>, reducer: R, options: TreeOptions) -> Self {
        let mut tree = Self::new(stored.site, reducer, options);
        if let Some(known) = stored.known_sites {
            for site in known {
                tree.register_site(site);
            }
        }

        let atoms = stored.weave.unwrap_or_default();
        let latest = atoms.iter().map(|atom| atom.id.timestamp).max().unwrap_or(0);
        tree.weave.import(atoms);
        tree.factory = AtomFactory::new(tree.site.id, latest);
        debug!(
            site = tree.site.id,
            atoms = tree.weave.len(),
            time = latest,
            "restored causal tree"
        );
        tree
    }

    /// Snapshot this replica in its stored form.
    #[must_use]
    pub fn export(&self) -> StoredCausalTree<O> {
        StoredCausalTree {
            site: self.site,
            known_sites: Some(self.known_sites.clone()),
            weave: Some(self.weave.atoms().to_vec()),
        }
    }

    #[must_use]
    pub const fn site(&self) -> SiteInfo {
        self.site
    }

    #[must_use]
    pub fn known_sites(&self) -> &[SiteInfo] {
        &self.known_sites
    }

    /// Record a peer site. Bookkeeping only; sites are never learned from
    /// imported atoms.
    pub fn register_site(&mut self, site: SiteInfo) {
        if !self.known_sites.contains(&site) {
            self.known_sites.push(site);
        }
    }

    #[must_use]
    pub const fn time(&self) -> u64 {
        self.factory.time()
    }

    #[must_use]
    pub const fn weave(&self) -> &Weave<O> {
        &self.weave
    }

    #[must_use]
    pub const fn options(&self) -> TreeOptions {
        self.options
    }

    #[must_use]
    pub const fn reducer(&self) -> &R {
        &self.reducer
    }

    #[must_use]
    pub fn version(&self) -> WeaveVersion {
        self.weave.version()
    }

    /// Strict structural validation of the weave.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidWeave`] describing the first violation.
    pub fn validate(&self) -> Result<(), TreeError> {
        Ok(self.weave.check()?)
    }

    /// Give up on atoms still waiting for a cause that may never arrive.
    ///
    /// Returns the dropped atoms so a transport can ask for their causes
    /// and deliver them again later.
    pub fn drain_pending(&mut self) -> Vec<Atom<O>> {
        let drained = self.weave.drain_pending();
        if !drained.is_empty() {
            warn!(site = self.site.id, dropped = drained.len(), "dropped atoms waiting for a cause");
        }
        drained
    }

    /// Forget the ids of atoms removed by garbage collection; returns how
    /// many were forgotten. Call only once no peer can deliver them again.
    pub fn forget_archived(&mut self) -> usize {
        let forgotten = self.weave.forget_archived();
        debug!(site = self.site.id, forgotten, "forgot archived atom ids");
        forgotten
    }

    /// Open a notification channel.
    pub fn subscribe(&mut self) -> Receiver<TreeEvent<O>> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// The materialized value, recomputed only after a mutation.
    pub fn value(&mut self) -> &R::Value {
        let Self {
            memo,
            reducer,
            weave,
            ..
        } = self;
        memo.get_or_insert_with(|| reducer.eval(weave))
    }

    #[must_use]
    pub const fn is_memoized(&self) -> bool {
        self.memo.is_some()
    }

    /// Drop the memoized value.
    pub fn invalidate(&mut self) {
        self.memo = None;
    }

    /// Add a single atom, local or foreign.
    pub fn add(&mut self, atom: Atom<O>) -> Vec<Atom<O>> {
        if atom.id.site != self.site.id {
            self.factory.update_time(atom.id.timestamp);
        }
        let added = self.weave.insert(atom);
        self.after_mutation(added)
    }

    /// Import a batch of atoms, typically from another replica.
    ///
    /// The clock absorbs every foreign atom seen for the first time, in
    /// ascending timestamp order. That includes atoms buffered as orphans or
    /// dropped under an archived cause, so replicas with and without garbage
    /// collection keep identical clocks. Already-seen atoms are skipped, so
    /// re-importing the same batch changes neither the weave nor the clock.
    pub fn import<I>(&mut self, atoms: I) -> Vec<Atom<O>>
    where
        I: IntoIterator<Item = Atom<O>>,
    {
        let atoms: Vec<Atom<O>> = atoms.into_iter().collect();

        let mut first_seen = HashSet::new();
        let mut foreign: Vec<u64> = atoms
            .iter()
            .filter(|atom| atom.id.site != self.site.id && !self.weave.has_seen(&atom.id))
            .filter(|atom| first_seen.insert(atom.id))
            .map(|atom| atom.id.timestamp)
            .collect();
        foreign.sort_unstable();

        let added = self.weave.import(atoms);
        for timestamp in foreign {
            self.factory.update_time(timestamp);
        }

        debug!(site = self.site.id, added = added.len(), "imported atoms");
        self.after_mutation(added)
    }

    /// Stamp a new local atom and add it.
    pub fn create(&mut self, op: O, cause: Option<AtomId>, priority: u32) -> Atom<O> {
        let atom = self.factory.create(op, cause, priority);
        self.add(atom.clone());
        atom
    }

    /// Run `f` as one batch: a single `AtomsAdded` notification and one
    /// garbage-collection pass when the outermost batch ends.
    pub fn batch<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.begin_batch();
        let out = f(self);
        self.end_batch();
        out
    }

    pub(crate) const fn begin_batch(&mut self) {
        self.batch_depth += 1;
    }

    pub(crate) fn end_batch(&mut self) {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.batch_depth > 0 {
            return;
        }
        let added = std::mem::take(&mut self.batch_added);
        if !added.is_empty() {
            self.notify(TreeEvent::AtomsAdded(added));
        }
        self.collect_garbage();
    }

    fn after_mutation(&mut self, added: Vec<Atom<O>>) -> Vec<Atom<O>> {
        if added.is_empty() {
            return added;
        }
        self.invalidate();

        if self.batch_depth > 0 {
            self.batch_added.extend(added.iter().cloned());
        } else {
            self.notify(TreeEvent::AtomsAdded(added.clone()));
            self.collect_garbage();
        }
        added
    }

    fn collect_garbage(&mut self) {
        if !self.options.garbage_collection {
            return;
        }
        let dead = self.reducer.collect_garbage(&self.weave);
        if dead.is_empty() {
            return;
        }

        let removed = self.weave.remove_subtrees(&dead);
        if removed.is_empty() {
            return;
        }
        self.invalidate();

        info!(
            site = self.site.id,
            archived = removed.len(),
            remaining = self.weave.len(),
            "garbage collected atoms"
        );
        self.notify(TreeEvent::AtomsArchived(removed));
    }

    fn notify(&mut self, event: TreeEvent<O>) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Concatenates every char atom in weave order.
    struct Concat;

    impl Reducer<char> for Concat {
        type Value = String;

        fn eval(&self, weave: &Weave<char>) -> String {
            weave.atoms().iter().skip(1).map(|atom| atom.value).collect()
        }
    }

    /// Treats `'x'` atoms as dead.
    struct DropX;

    impl Reducer<char> for DropX {
        type Value = String;

        fn eval(&self, weave: &Weave<char>) -> String {
            Concat.eval(weave)
        }

        fn collect_garbage(&self, weave: &Weave<char>) -> Vec<AtomId> {
            weave
                .atoms()
                .iter()
                .filter(|atom| atom.value == 'x')
                .map(|atom| atom.id)
                .collect()
        }
    }

    fn tree(site: u32) -> CausalTree<char, Concat> {
        CausalTree::new(SiteInfo::new(site), Concat, TreeOptions::default())
    }

    fn drain<O>(rx: &Receiver<TreeEvent<O>>) -> Vec<TreeEvent<O>> {
        rx.try_iter().collect()
    }

    #[test]
    fn create_stamps_and_adds() {
        let mut tree = tree(1);
        let root = tree.create('_', None, 0);
        let a = tree.create('a', Some(root.id), 0);

        assert_eq!(root.id, AtomId::new(1, 1, 0));
        assert_eq!(a.id.timestamp, 2);
        assert_eq!(tree.time(), 2);
        assert_eq!(tree.value(), "a");
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn value_is_memoized_until_mutation() {
        let mut tree = tree(1);
        let root = tree.create('_', None, 0);
        assert!(!tree.is_memoized());

        tree.value();
        assert!(tree.is_memoized());

        tree.create('b', Some(root.id), 0);
        assert!(!tree.is_memoized());
        assert_eq!(tree.value(), "b");

        tree.invalidate();
        assert!(!tree.is_memoized());
    }

    #[test]
    fn foreign_atoms_advance_the_clock() {
        let mut tree = tree(1);
        let root = tree.create('_', None, 0);
        tree.add(Atom::new(AtomId::new(2, 10, 0), Some(root.id), 'z'));
        assert_eq!(tree.time(), 11);

        // Own atoms never move the clock.
        tree.add(Atom::new(AtomId::new(1, 50, 0), Some(root.id), 'y'));
        assert_eq!(tree.time(), 11);
    }

    #[test]
    fn import_is_idempotent_for_clock_and_value() {
        let mut source = tree(2);
        let root = source.create('_', None, 0);
        source.create('a', Some(root.id), 0);
        source.create('b', Some(root.id), 0);
        let atoms = source.weave().atoms().to_vec();

        let mut replica = tree(1);
        let added = replica.import(atoms.clone());
        assert_eq!(added.len(), 3);
        let time = replica.time();
        let value = replica.value().clone();

        assert!(replica.import(atoms).is_empty());
        assert_eq!(replica.time(), time);
        assert_eq!(replica.value(), &value);
        assert_eq!(value, "ba");
    }

    #[test]
    fn add_notifies_once_per_mutation() {
        let mut tree = tree(1);
        let rx = tree.subscribe();
        let root = tree.create('_', None, 0);
        tree.create('a', Some(root.id), 0);
        tree.add(root.clone());

        let events = drain(&rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], TreeEvent::AtomsAdded(atoms) if atoms.len() == 1));
    }

    #[test]
    fn batch_emits_single_notification() {
        let mut tree = tree(1);
        let rx = tree.subscribe();

        let root = tree.batch(|tree| {
            let root = tree.create('_', None, 0);
            tree.batch(|tree| {
                tree.create('a', Some(root.id), 0);
            });
            tree.create('b', Some(root.id), 0);
            root
        });

        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            TreeEvent::AtomsAdded(atoms) => {
                let values: Vec<char> = atoms.iter().map(|atom| atom.value).collect();
                assert_eq!(values, vec!['_', 'a', 'b']);
            }
            TreeEvent::AtomsArchived(_) => panic!("unexpected archive"),
        }
        assert!(tree.weave().contains(&root.id));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut tree = tree(1);
        drop(tree.subscribe());
        let rx = tree.subscribe();
        tree.create('_', None, 0);
        assert_eq!(drain(&rx).len(), 1);
        assert_eq!(tree.subscribers.len(), 1);
    }

    #[test]
    fn garbage_collection_archives_and_notifies() {
        let mut tree = CausalTree::new(SiteInfo::new(1), DropX, TreeOptions::default());
        let rx = tree.subscribe();
        let root = tree.create('_', None, 0);
        let x = tree.create('x', Some(root.id), 0);
        tree.create('y', Some(x.id), 0);

        assert_eq!(tree.value(), "");
        assert!(tree.weave().is_archived(&x.id));

        let events = drain(&rx);
        let archived: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                TreeEvent::AtomsArchived(atoms) => Some(atoms.len()),
                TreeEvent::AtomsAdded(_) => None,
            })
            .collect();
        assert_eq!(archived, vec![1]);
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn garbage_collection_waits_for_batch_end() {
        let mut tree = CausalTree::new(SiteInfo::new(1), DropX, TreeOptions::default());
        let root = tree.create('_', None, 0);

        tree.batch(|tree| {
            tree.create('x', Some(root.id), 0);
            assert_eq!(tree.weave().len(), 2);
        });
        assert_eq!(tree.weave().len(), 1);
    }

    #[test]
    fn disabled_garbage_collection_keeps_atoms() {
        let mut tree = CausalTree::new(SiteInfo::new(1), DropX, TreeOptions::without_gc());
        let root = tree.create('_', None, 0);
        tree.create('x', Some(root.id), 0);
        assert_eq!(tree.weave().len(), 2);
        assert_eq!(tree.value(), "x");
    }

    #[test]
    fn known_sites_are_explicit() {
        let mut tree = tree(1);
        let root = tree.create('_', None, 0);
        tree.add(Atom::new(AtomId::new(5, 3, 0), Some(root.id), 'q'));
        assert_eq!(tree.known_sites(), &[SiteInfo::new(1)]);

        tree.register_site(SiteInfo::new(5));
        tree.register_site(SiteInfo::new(5));
        assert_eq!(tree.known_sites().len(), 2);
    }

    #[test]
    fn stored_round_trip_restores_clock_and_atoms() {
        let mut tree = tree(1);
        let root = tree.create('_', None, 0);
        tree.create('a', Some(root.id), 0);
        tree.register_site(SiteInfo::new(3));

        let json = tree.export().to_json().expect("encode");
        assert!(json.contains("knownSites"));

        let stored = StoredCausalTree::<char>::from_json(&json).expect("decode");
        let mut restored = CausalTree::from_stored(stored, Concat, TreeOptions::default());
        assert_eq!(restored.time(), 2);
        assert_eq!(restored.known_sites().len(), 2);
        assert_eq!(restored.value(), "a");
        assert_eq!(restored.version(), tree.version());
        assert_eq!(restored.create('b', Some(root.id), 0).id.timestamp, 3);
    }

    #[test]
    fn stored_tree_accepts_missing_fields() {
        let stored = StoredCausalTree::<char>::from_json(r#"{"site":{"id":4}}"#).expect("decode");
        assert!(stored.known_sites.is_none());
        assert!(stored.weave.is_none());

        let tree = CausalTree::from_stored(stored, Concat, TreeOptions::default());
        assert_eq!(tree.known_sites(), &[SiteInfo::new(4)]);
        assert!(tree.weave().is_empty());
    }

    #[test]
    fn owner_can_release_buffered_and_archived_atoms() {
        let mut tree = CausalTree::new(SiteInfo::new(1), DropX, TreeOptions::default());
        let root = tree.create('_', None, 0);
        let x = tree.create('x', Some(root.id), 0);
        assert!(tree.weave().is_archived(&x.id));

        let orphan = Atom::new(AtomId::new(2, 9, 0), Some(AtomId::new(2, 8, 0)), 'o');
        tree.import(vec![orphan.clone()]);
        assert_eq!(tree.weave().pending_len(), 1);

        assert_eq!(tree.drain_pending(), vec![orphan]);
        assert_eq!(tree.weave().pending_len(), 0);
        assert_eq!(tree.forget_archived(), 1);
        assert_eq!(tree.weave().archived_len(), 0);
        assert_eq!(tree.time(), 10);
    }

    #[test]
    fn validate_surfaces_weave_errors() {
        let tree = tree(1);
        let err = tree.validate().expect_err("empty weave has no root");
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidWeave);
    }
}
