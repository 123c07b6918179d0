pub mod env {
    use parking_lot::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serializes tests that touch `AMP_*` variables and restores them on drop.
    pub struct EnvGuard {
        _lock: MutexGuard<'static, ()>,
        saved: Vec<(&'static str, Option<String>)>,
    }

    pub fn guard() -> EnvGuard {
        EnvGuard {
            _lock: ENV_LOCK.lock(),
            saved: Vec::new(),
        }
    }

    impl EnvGuard {
        fn remember(&mut self, key: &'static str) {
            if self.saved.iter().any(|(k, _)| *k == key) {
                return;
            }
            self.saved.push((key, std::env::var(key).ok()));
        }

        pub fn set(&mut self, key: &'static str, value: &str) {
            self.remember(key);
            std::env::set_var(key, value);
        }

        pub fn clear_keys(&mut self, keys: &[&'static str]) {
            for &key in keys {
                self.remember(key);
                std::env::remove_var(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, val) in self.saved.drain(..) {
                match val {
                    Some(v) => std::env::set_var(key, v),
                    None => std::env::remove_var(key),
                }
            }
        }
    }
}

pub mod store {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::store::{MemoryStore, Root, Store};

    /// Memory store whose next `failures` saves return an error.
    #[derive(Clone, Default)]
    pub struct FlakyStore {
        pub inner: MemoryStore,
        failures: Arc<AtomicUsize>,
    }

    impl FlakyStore {
        pub fn fail_next(&self, saves: usize) {
            self.failures.store(saves, Ordering::SeqCst);
        }
    }

    impl Store for FlakyStore {
        fn load(&self) -> anyhow::Result<Option<Root>> {
            self.inner.load()
        }

        fn save(&mut self, root: &Root) -> anyhow::Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("database is locked");
            }
            self.inner.save(root)
        }
    }
}
