//! Logical transaction handles

use std::sync::atomic::{AtomicU64, Ordering};

use super::backend::IsolationLevel;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Requested kind of a new transaction level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ReadCommitted,
    Serializable,
    /// Same as the enclosing level, or read committed outside a transaction
    Enclosing,
}

impl TransactionType {
    pub fn isolation(&self) -> IsolationLevel {
        match self {
            TransactionType::Serializable => IsolationLevel::Serializable,
            _ => IsolationLevel::ReadCommitted,
        }
    }
}

/// One level of a session's transaction chain
#[derive(Debug)]
pub struct TransactionHandle {
    id: String,
    transaction_type: TransactionType,
    parent: Option<Box<TransactionHandle>>,
}

impl TransactionHandle {
    /// Push a new level on top of `parent`. `Enclosing` must already be resolved.
    pub fn new(parent: Option<Box<TransactionHandle>>, transaction_type: TransactionType) -> Self {
        debug_assert!(transaction_type != TransactionType::Enclosing);
        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("txn-{id}"),
            transaction_type,
            parent,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.transaction_type
    }

    pub fn parent(&self) -> Option<&TransactionHandle> {
        self.parent.as_deref()
    }

    pub fn is_outermost(&self) -> bool {
        self.parent.is_none()
    }

    /// Number of levels including this one
    pub fn depth(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.depth())
    }

    /// Pop this level, returning the enclosing one
    pub fn into_parent(self) -> Option<Box<TransactionHandle>> {
        self.parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain() {
        let outer = Box::new(TransactionHandle::new(None, TransactionType::ReadCommitted));
        let outer_id = outer.id().to_string();
        let inner = TransactionHandle::new(Some(outer), TransactionType::Serializable);

        assert_ne!(inner.id(), outer_id);
        assert_eq!(inner.depth(), 2);
        assert!(!inner.is_outermost());
        assert_eq!(inner.parent().map(|p| p.id()), Some(outer_id.as_str()));
        assert_eq!(inner.transaction_type().isolation(), IsolationLevel::Serializable);

        let outer = inner.into_parent().unwrap();
        assert!(outer.is_outermost());
        assert!(outer.into_parent().is_none());
    }
}
