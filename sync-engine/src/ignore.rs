//! Ignore predicate.

/// Decides whether a name is excluded from synchronization.
pub trait IgnoreMatcher: Send + Sync {
    /// True if `name` is ignored.
    fn is_ignored(&self, name: &str) -> bool;
}

/// Ignores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIgnores;

impl IgnoreMatcher for NoIgnores {
    fn is_ignored(&self, _name: &str) -> bool {
        false
    }
}

impl<F> IgnoreMatcher for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_ignored(&self, name: &str) -> bool {
        self(name)
    }
}
