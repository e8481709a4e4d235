use std::fmt;
use std::sync::Arc;

/// Identity of a cacheable remote resource: a name plus ordered parameters.
///
/// `conversation` + `["alice"]` and `conversation` + `["bob"]` are different
/// keys sharing the same name, which is what [`KeyFilter::Name`] matches on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    name: String,
    params: Vec<String>,
}

impl ResourceKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn param(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for p in &self.params {
            write!(f, ":{}", p)?;
        }
        Ok(())
    }
}

impl From<&str> for ResourceKey {
    fn from(name: &str) -> Self {
        ResourceKey::new(name)
    }
}

/// Selects the keys an invalidation applies to.
#[derive(Clone)]
pub enum KeyFilter {
    Exact(ResourceKey),
    /// Every key with this name, whatever its parameters.
    Name(String),
    All,
    Predicate(Arc<dyn Fn(&ResourceKey) -> bool + Send + Sync>),
}

impl KeyFilter {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&ResourceKey) -> bool + Send + Sync + 'static,
    {
        KeyFilter::Predicate(Arc::new(f))
    }

    pub fn matches(&self, key: &ResourceKey) -> bool {
        match self {
            KeyFilter::Exact(k) => k == key,
            KeyFilter::Name(name) => key.name() == name,
            KeyFilter::All => true,
            KeyFilter::Predicate(f) => f(key),
        }
    }
}

impl fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyFilter::Exact(k) => write!(f, "Exact({})", k),
            KeyFilter::Name(n) => write!(f, "Name({})", n),
            KeyFilter::All => f.write_str("All"),
            KeyFilter::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<ResourceKey> for KeyFilter {
    fn from(key: ResourceKey) -> Self {
        KeyFilter::Exact(key)
    }
}
