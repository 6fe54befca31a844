//! Latest-wins mailbox
//!
//! A one-slot buffer. Putting a value into a full slot overwrites the old
//! value and hands it back so the caller can account for it. Memory held is
//! one value regardless of how many deposits happen between drains.

/// Single-slot, overwrite-on-put buffer
#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Option<T>,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self { slot: None }
    }
}

impl<T> Mailbox<T> {
    /// Create an empty mailbox
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposit a value, returning the one it replaced
    pub fn put(&mut self, value: T) -> Option<T> {
        self.slot.replace(value)
    }

    /// Take the value out, leaving the slot empty
    pub fn take(&mut self) -> Option<T> {
        self.slot.take()
    }

    /// Look at the value without taking it
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.slot.as_ref()
    }

    /// Whether the slot is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_mailbox() {
        let mut mailbox: Mailbox<u32> = Mailbox::new();
        assert!(mailbox.is_empty());
        assert_eq!(mailbox.peek(), None);
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn test_holds_only_latest() {
        let mut mailbox = Mailbox::new();
        let replaced = (0..1000u32).filter_map(|i| mailbox.put(i)).count();
        assert_eq!(replaced, 999);
        assert_eq!(mailbox.peek(), Some(&999));
        assert_eq!(mailbox.take(), Some(999));
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_put_returns_replaced_value() {
        let mut mailbox = Mailbox::new();
        assert_eq!(mailbox.put("a"), None);
        assert_eq!(mailbox.put("b"), Some("a"));
        assert_eq!(mailbox.take(), Some("b"));
        assert_eq!(mailbox.put("c"), None);
    }
}
