//! Typed per-connection property map.
//!
//! Higher layers hang their own state off a connection (for example which
//! callback client a connection belongs to) without the session knowing the
//! types involved. One value per type.

use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Type-keyed values shared by every handle of one connection.
#[derive(Default, Clone)]
pub struct Properties {
    values: Arc<RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>>,
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Properties")
            .field("len", &self.values.read().len())
            .finish()
    }
}

impl Properties {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&self, value: T) -> Option<Arc<T>> {
        self.values
            .write()
            .insert(TypeId::of::<T>(), Arc::new(value))
            .and_then(|old| old.downcast::<T>().ok())
    }

    /// Returns the value of type `T`, if set.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values
            .read()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }

    /// Removes and returns the value of type `T`.
    pub fn remove<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values
            .write()
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
    }

    /// Whether a value of type `T` is set.
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.values.read().contains_key(&TypeId::of::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct CallbackClient(String);

    #[test]
    fn test_insert_get_remove() {
        let props = Properties::new();
        assert!(props.get::<CallbackClient>().is_none());
        assert!(props.insert(CallbackClient("edge-1".into())).is_none());
        props.insert(42u32);

        let shared = props.clone();
        assert_eq!(*shared.get::<CallbackClient>().unwrap(), CallbackClient("edge-1".into()));
        assert_eq!(*shared.get::<u32>().unwrap(), 42);

        let old = props.insert(CallbackClient("edge-2".into())).unwrap();
        assert_eq!(old.0, "edge-1");
        assert_eq!(props.remove::<CallbackClient>().unwrap().0, "edge-2");
        assert!(!props.contains::<CallbackClient>());
        assert!(props.contains::<u32>());
    }
}
