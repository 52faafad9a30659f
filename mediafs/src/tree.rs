//! Holds the published [Generation] and swaps it atomically.
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, instrument};

use crate::errors::Error;
use crate::nodes::{Generation, Node};

/// Readers take a cheap [Arc] snapshot of the current generation and keep
/// using it for as long as they like; a publish never changes a generation
/// someone already holds.
pub struct TreeManager {
    current: RwLock<Arc<Generation>>,
    published: watch::Sender<u64>,
}

impl Default for TreeManager {
    fn default() -> Self {
        Self::new(Generation::empty())
    }
}

impl TreeManager {
    pub fn new(initial: Generation) -> Self {
        let (published, _) = watch::channel(initial.sequence());
        Self {
            current: RwLock::new(Arc::new(initial)),
            published,
        }
    }

    pub fn current(&self) -> Arc<Generation> {
        self.current.read().clone()
    }

    /// Resolves a path in the current generation.
    pub fn resolve(&self, path: &str) -> Option<Arc<Node>> {
        self.current().resolve(path)
    }

    /// Notified with the sequence number of every published generation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.published.subscribe()
    }

    /// Makes `generation` the current one.
    ///
    /// Sequences only move forward: a generation not newer than the current
    /// one is refused, except while the empty initial generation is in place.
    #[instrument(skip_all, fields(generation.sequence = generation.sequence(), generation.nodes = generation.node_count()), err)]
    pub fn publish(&self, generation: Generation) -> Result<Arc<Generation>, Error> {
        let generation = Arc::new(generation);
        {
            let mut current = self.current.write();
            let current_sequence = current.sequence();
            if current_sequence != 0 && generation.sequence() <= current_sequence {
                return Err(Error::StalePublish {
                    current: current_sequence,
                    offered: generation.sequence(),
                });
            }
            *current = generation.clone();
        }

        self.published.send_replace(generation.sequence());
        info!("published generation");
        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::TreeManager;
    use crate::errors::Error;
    use crate::fixtures;
    use crate::nodes::Generation;

    #[test]
    fn starts_empty() {
        let tree = TreeManager::default();
        assert_eq!(0, tree.current().sequence());
        assert!(tree.resolve("/").is_some());
        assert!(tree.resolve("/Movies").is_none());
    }

    #[test]
    fn publish_replaces_current() {
        let tree = TreeManager::default();
        let mut published = tree.subscribe();

        tree.publish(fixtures::sample_generation(1)).unwrap();
        assert_eq!(1, tree.current().sequence());
        assert!(tree.resolve("/Movies/Heat (1995).mkv").is_some());
        assert!(published.has_changed().unwrap());
        assert_eq!(1, *published.borrow_and_update());
    }

    #[test]
    fn refuses_older_generations() {
        let tree = TreeManager::new(fixtures::sample_generation(3));

        for offered in [2, 3] {
            match tree.publish(fixtures::sample_generation(offered)) {
                Err(Error::StalePublish { current, offered: o }) => {
                    assert_eq!(3, current);
                    assert_eq!(offered, o);
                }
                other => panic!("unexpected result: {:?}", other.map(|g| g.sequence())),
            }
        }
        assert_eq!(3, tree.current().sequence());
        tree.publish(fixtures::sample_generation(4)).unwrap();
    }

    /// A reader holding a generation keeps seeing it unchanged across publishes.
    #[test]
    fn snapshots_survive_publish() {
        let tree = TreeManager::new(fixtures::sample_generation(1));
        let snapshot = tree.current();

        tree.publish(Generation::new(
            2,
            0,
            Generation::empty().root_directory().clone(),
        ))
        .unwrap();

        assert!(tree.resolve("/Movies").is_none());
        assert!(snapshot.resolve("/Movies/Alien (1979).mkv").is_some());
        assert_eq!(1, snapshot.sequence());
    }

    /// Concurrent readers observe either the old or the new generation,
    /// never a mix.
    #[test]
    fn concurrent_resolve_during_publish() {
        let tree = Arc::new(TreeManager::new(fixtures::sample_generation(1)));
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let tree = tree.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        let generation = tree.current();
                        let heat = generation.resolve("/Movies/Heat (1995).mkv").is_some();
                        let shows = generation.resolve("/TV Shows").is_some();
                        // both exist in odd generations, neither in even ones.
                        assert_eq!(heat, shows);
                        assert_eq!(generation.sequence() % 2 == 1, heat);
                    }
                })
            })
            .collect();

        for sequence in 2..200 {
            let generation = if sequence % 2 == 1 {
                fixtures::sample_generation(sequence)
            } else {
                Generation::new(sequence, 0, Generation::empty().root_directory().clone())
            };
            tree.publish(generation).unwrap();
        }

        stop.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
