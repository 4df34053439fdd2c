use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Reference to a resource as it appears in payloads and caller requests.
/// Any combination of `id` and `lid` may be present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
}

impl ResourceRef {
    pub fn new<T: Into<String>, I: Into<String>>(type_name: T, id: I) -> Self {
        Self {
            type_name: type_name.into(),
            id: Some(id.into()),
            lid: None,
        }
    }

    pub fn from_lid<T: Into<String>, L: Into<String>>(type_name: T, lid: L) -> Self {
        Self {
            type_name: type_name.into(),
            id: None,
            lid: Some(lid.into()),
        }
    }

    pub fn with_lid<L: Into<String>>(mut self, lid: L) -> Self {
        self.lid = Some(lid.into());
        self
    }
}

struct IdentifierInner {
    lid: Arc<str>,
    type_name: Arc<str>,
    id: RwLock<Option<String>>,
    forgotten: AtomicBool,
}

/// Stable handle for one logical resource.
///
/// Handles are minted only by the identifier cache. Equality is handle
/// identity; hashing goes through the `lid`, which the cache never hands out
/// twice, so the two agree.
#[derive(Clone)]
pub struct Identifier {
    inner: Arc<IdentifierInner>,
}

impl Identifier {
    pub(crate) fn mint(type_name: &str, id: Option<String>, lid: String) -> Self {
        Self {
            inner: Arc::new(IdentifierInner {
                lid: Arc::from(lid),
                type_name: Arc::from(type_name),
                id: RwLock::new(id),
                forgotten: AtomicBool::new(false),
            }),
        }
    }

    pub fn lid(&self) -> &str {
        &self.inner.lid
    }

    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn id(&self) -> Option<String> {
        self.inner.id.read().clone()
    }

    pub fn has_id(&self) -> bool {
        self.inner.id.read().is_some()
    }

    pub fn is_forgotten(&self) -> bool {
        self.inner.forgotten.load(Ordering::Acquire)
    }

    pub fn to_ref(&self) -> ResourceRef {
        ResourceRef {
            type_name: self.type_name().to_string(),
            id: self.id(),
            lid: Some(self.lid().to_string()),
        }
    }

    pub(crate) fn set_id(&self, id: String) {
        *self.inner.id.write() = Some(id);
    }

    pub(crate) fn mark_forgotten(&self) {
        self.inner.forgotten.store(true, Ordering::Release);
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Identifier {}

impl Hash for Identifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.lid.hash(state)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}:{}", self.type_name(), id),
            None => write!(f, "{}:{}", self.type_name(), self.lid()),
        }
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identifier")
            .field("type", &self.type_name())
            .field("id", &self.id())
            .field("lid", &self.lid())
            .field("forgotten", &self.is_forgotten())
            .finish()
    }
}
