pub mod env {
    use parking_lot::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Holds the process-wide env lock; restores touched `AMP_*` keys on drop.
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
        pub fn set(&mut self, key: &'static str, value: impl AsRef<str>) {
            self.save(key);
            std::env::set_var(key, value.as_ref());
        }

        pub fn remove(&mut self, key: &'static str) {
            self.save(key);
            std::env::remove_var(key);
        }

        fn save(&mut self, key: &'static str) {
            if !self.saved.iter().any(|(k, _)| *k == key) {
                self.saved.push((key, std::env::var(key).ok()));
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            while let Some((key, value)) = self.saved.pop() {
                match value {
                    Some(v) => std::env::set_var(key, v),
                    None => std::env::remove_var(key),
                }
            }
        }
    }
}
