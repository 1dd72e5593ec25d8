//! Typed configuration store with change notification.
//!
//! Variables are registered in a process-wide table keyed by lowercase
//! dotted names. Each variable carries a description and a set of change
//! listeners that fire when the value actually changes.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::error;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

/// Types storable in a [`ConfigVar`].
pub trait ConfigValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> ConfigValue for T {}

type ChangeListener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// Errors from the configuration registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The name contains characters outside `[a-z0-9._]`.
    #[error("invalid configuration name {0:?}")]
    InvalidName(String),

    /// The name is registered under a different value type.
    #[error("configuration {name:?} is registered as {registered}, not {requested}")]
    TypeMismatch {
        /// The normalized variable name.
        name: String,
        /// Type the variable was first registered with.
        registered: &'static str,
        /// Type this lookup asked for.
        requested: &'static str,
    },
}

/// A named configuration variable.
///
/// Reads clone the value; writes replace it and notify listeners with the
/// old and new values. A write with an equal value is a no-op and fires
/// nothing.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<FxHashMap<u64, ChangeListener<T>>>,
}

impl<T: ConfigValue> ConfigVar<T> {
    /// Create a variable that is not attached to the registry.
    ///
    /// [`Config::lookup`] is the usual entry point; this exists for
    /// fallbacks and tests.
    pub fn new(name: impl Into<String>, value: T, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            value: RwLock::new(value),
            listeners: Mutex::new(FxHashMap::default()),
        }
    }

    /// The variable's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The variable's description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// A copy of the current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Replace the value, notifying listeners if it changed.
    pub fn set(&self, new_value: T) {
        let old_value = {
            let mut value = self.value.write();
            if *value == new_value {
                return;
            }
            let old_value = value.clone();
            *value = new_value.clone();
            old_value
        };
        // Listeners run outside the value lock so they may read the
        // variable themselves.
        let listeners: Vec<ChangeListener<T>> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(&old_value, &new_value);
        }
    }

    /// Register a change listener; the returned key removes it.
    pub fn add_listener(&self, listener: impl Fn(&T, &T) + Send + Sync + 'static) -> u64 {
        static NEXT_LISTENER_KEY: AtomicU64 = AtomicU64::new(1);
        let key = NEXT_LISTENER_KEY.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(key, Arc::new(listener));
        key
    }

    /// Remove the listener registered under `key`, if any.
    pub fn remove_listener(&self, key: u64) {
        self.listeners.lock().remove(&key);
    }

    /// Remove all listeners.
    pub fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }
}

impl<T: fmt::Debug> fmt::Debug for ConfigVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigVar")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("value", &*self.value.read())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

struct RegistryEntry {
    type_name: &'static str,
    var: Arc<dyn Any + Send + Sync>,
}

static REGISTRY: Lazy<RwLock<FxHashMap<String, RegistryEntry>>> =
    Lazy::new(|| RwLock::new(FxHashMap::default()));

/// The process-wide configuration registry.
pub struct Config;

impl Config {
    /// Fetch the variable named `name`, registering it with `default` and
    /// `description` on first use.
    ///
    /// Names are case-insensitive and restricted to `[a-z0-9._]`. Looking
    /// an existing name up under a different type is an error and leaves
    /// the registered variable untouched.
    pub fn lookup<T: ConfigValue>(
        name: &str,
        default: T,
        description: &str,
    ) -> Result<Arc<ConfigVar<T>>, ConfigError> {
        let key = normalize_name(name)?;
        {
            let registry = REGISTRY.read();
            if let Some(entry) = registry.get(&key) {
                return downcast_entry::<T>(&key, entry);
            }
        }

        let mut registry = REGISTRY.write();
        // Racing registration may have won the write lock first.
        if let Some(entry) = registry.get(&key) {
            return downcast_entry::<T>(&key, entry);
        }
        let var = Arc::new(ConfigVar::new(key.clone(), default, description));
        registry.insert(
            key,
            RegistryEntry {
                type_name: std::any::type_name::<T>(),
                var: Arc::clone(&var) as Arc<dyn Any + Send + Sync>,
            },
        );
        Ok(var)
    }

    /// Fetch the variable named `name` if it is already registered under
    /// type `T`.
    pub fn lookup_existing<T: ConfigValue>(name: &str) -> Option<Arc<ConfigVar<T>>> {
        let key = normalize_name(name).ok()?;
        let registry = REGISTRY.read();
        let entry = registry.get(&key)?;
        Arc::clone(&entry.var).downcast::<ConfigVar<T>>().ok()
    }
}

fn normalize_name(name: &str) -> Result<String, ConfigError> {
    let key = name.to_ascii_lowercase();
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_');
    if !valid {
        return Err(ConfigError::InvalidName(name.to_string()));
    }
    Ok(key)
}

fn downcast_entry<T: ConfigValue>(
    name: &str,
    entry: &RegistryEntry,
) -> Result<Arc<ConfigVar<T>>, ConfigError> {
    match Arc::clone(&entry.var).downcast::<ConfigVar<T>>() {
        Ok(var) => Ok(var),
        Err(_) => {
            error!(
                "configuration {:?} requested as {} but registered as {}",
                name,
                std::any::type_name::<T>(),
                entry.type_name
            );
            Err(ConfigError::TypeMismatch {
                name: name.to_string(),
                registered: entry.type_name,
                requested: std::any::type_name::<T>(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_registers_default() {
        let var = Config::lookup("test.config.default", 42u64, "answer").unwrap();
        assert_eq!(var.get(), 42);
        assert_eq!(var.name(), "test.config.default");
        assert_eq!(var.description(), "answer");
    }

    #[test]
    fn lookup_is_idempotent() {
        let first = Config::lookup("test.config.idempotent", 1u32, "first").unwrap();
        first.set(9);
        let second = Config::lookup("test.config.idempotent", 1u32, "second").unwrap();
        // Same variable, not a fresh default.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.get(), 9);
    }

    #[test]
    fn names_are_case_insensitive() {
        let lower = Config::lookup("test.config.case", 5i64, "").unwrap();
        let upper = Config::lookup("TEST.Config.CASE", 5i64, "").unwrap();
        assert!(Arc::ptr_eq(&lower, &upper));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let err = Config::lookup("test config spaces", 0u8, "").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidName(_)));
    }

    #[test]
    fn type_mismatch_is_an_error() {
        Config::lookup("test.config.typed", 1u16, "").unwrap();
        let err = Config::lookup("test.config.typed", String::new(), "").unwrap_err();
        assert!(matches!(err, ConfigError::TypeMismatch { .. }));
    }

    #[test]
    fn listeners_observe_changes() {
        let var = Config::lookup("test.config.listener", 10usize, "").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let key = var.add_listener(move |old, new| sink.lock().push((*old, *new)));

        var.set(10); // unchanged, no notification
        var.set(20);
        var.set(30);
        var.remove_listener(key);
        var.set(40);

        assert_eq!(*seen.lock(), vec![(10, 20), (20, 30)]);
    }

    #[test]
    fn debug_shows_name_and_value() {
        let var = ConfigVar::new("test.config.debug", 11u32, "debug rendering");
        let rendered = format!("{var:?}");
        assert!(rendered.contains("test.config.debug"));
        assert!(rendered.contains("11"));
    }

    #[test]
    fn lookup_existing_misses_unregistered() {
        assert!(Config::lookup_existing::<u64>("test.config.absent").is_none());
        Config::lookup("test.config.present", 3u64, "").unwrap();
        assert!(Config::lookup_existing::<u64>("test.config.present").is_some());
        assert!(Config::lookup_existing::<String>("test.config.present").is_none());
    }
}
