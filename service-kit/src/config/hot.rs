use std::sync::Arc;

use arc_swap::ArcSwap;

/// Hook run whenever a config value is (re)loaded.
///
/// `old` is `None` on the first load. Implementations build their runtime
/// handles into `new` and schedule whatever `old` owns for release.
pub trait Reloadable: Sized {
    fn on_update(old: Option<&Self>, new: &mut Self);
}

/// Holds the live value of a reloadable config.
///
/// Readers get a consistent snapshot through [`HotConfig::load`]; a reload
/// publishes a fully built value in one atomic swap.
pub struct HotConfig<T> {
    current: ArcSwap<T>,
}

impl<T: Reloadable> HotConfig<T> {
    pub fn new(mut value: T) -> Self {
        T::on_update(None, &mut value);
        Self {
            current: ArcSwap::from_pointee(value),
        }
    }

    pub fn load(&self) -> Arc<T> {
        self.current.load_full()
    }

    pub fn update(&self, mut value: T) {
        let old = self.current.load_full();
        T::on_update(Some(&old), &mut value);
        self.current.store(Arc::new(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Counter {
        limit: u32,
        generation: u32,
        previous_limit: Option<u32>,
    }

    impl Reloadable for Counter {
        fn on_update(old: Option<&Self>, new: &mut Self) {
            new.generation = old.map_or(1, |old| old.generation + 1);
            new.previous_limit = old.map(|old| old.limit);
        }
    }

    #[test]
    fn test_hook_runs_on_new_and_update() {
        let hot = HotConfig::new(Counter {
            limit: 5,
            ..Default::default()
        });
        assert_eq!(hot.load().generation, 1);
        assert_eq!(hot.load().previous_limit, None);

        let snapshot = hot.load();
        hot.update(Counter {
            limit: 8,
            ..Default::default()
        });

        let current = hot.load();
        assert_eq!(current.generation, 2);
        assert_eq!(current.limit, 8);
        assert_eq!(current.previous_limit, Some(5));
        // Earlier snapshots stay valid.
        assert_eq!(snapshot.limit, 5);
    }
}
