use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A typed token naming one value stored in a [`Bag`].
///
/// Keys are types rather than strings so unrelated handlers cannot collide:
///
/// ```
/// use lumosync::sync::{Bag, BagKey};
///
/// struct Attempts;
/// impl BagKey for Attempts {
///     type Value = u32;
/// }
///
/// let bag = Bag::background();
/// let next = bag.with::<Attempts>(1);
/// assert_eq!(next.get::<Attempts>(), Some(&1));
/// assert_eq!(bag.get::<Attempts>(), None);
/// ```
pub trait BagKey: 'static {
    type Value: Any + Send + Sync;
}

struct Node {
    key: TypeId,
    // `None` shadows an earlier binding of the same key.
    value: Option<Arc<dyn Any + Send + Sync>>,
    next: Option<Arc<Node>>,
}

/// Immutable context carried through one managed transaction and its
/// retries.
///
/// Extending a bag returns a new bag that shares structure with the old
/// one; bags already handed out never change. Cloning is cheap.
#[derive(Clone, Default)]
pub struct Bag {
    head: Option<Arc<Node>>,
}

impl Bag {
    /// An empty bag
    pub fn background() -> Self {
        Bag { head: None }
    }

    /// Return a bag in which `K` is bound to `value`
    pub fn with<K: BagKey>(&self, value: K::Value) -> Self {
        let value: Arc<dyn Any + Send + Sync> = Arc::new(value);
        self.push(TypeId::of::<K>(), Some(value))
    }

    /// Return a bag in which `K` is unbound
    pub fn without<K: BagKey>(&self) -> Self {
        if self.get::<K>().is_none() {
            return self.clone();
        }
        self.push(TypeId::of::<K>(), None)
    }

    /// The value bound to `K`, if any
    pub fn get<K: BagKey>(&self) -> Option<&K::Value> {
        let key = TypeId::of::<K>();
        let mut node = self.head.as_deref();
        while let Some(n) = node {
            if n.key == key {
                return n.value.as_deref().and_then(|v| v.downcast_ref::<K::Value>());
            }
            node = n.next.as_deref();
        }
        None
    }

    /// True when both bags are the same version of the same context
    pub fn ptr_eq(&self, other: &Bag) -> bool {
        match (&self.head, &other.head) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn push(&self, key: TypeId, value: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        // Rebinding the newest key replaces its node instead of stacking
        let next = match &self.head {
            Some(head) if head.key == key => head.next.clone(),
            head => head.clone(),
        };
        Bag {
            head: Some(Arc::new(Node { key, value, next })),
        }
    }
}

impl fmt::Debug for Bag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut len = 0;
        let mut node = self.head.as_deref();
        while let Some(n) = node {
            len += 1;
            node = n.next.as_deref();
        }
        f.debug_struct("Bag").field("bindings", &len).finish()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Unlink iteratively so long retry chains don't recurse on drop.
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.take(),
                Err(_) => break,
            }
        }
    }
}
