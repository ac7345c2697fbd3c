//! The per-process mailbox: an unbounded MPSC queue of message references
//! (§3, §4.7).

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::value::Reference;

/// A message already deep-copied (or, for permanent/embedded values,
/// reference-passed) into the receiver's heap by the sender (§4.7).
pub struct Mailbox {
    sender: Sender<Reference>,
    receiver: Receiver<Reference>,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Mailbox { sender, receiver }
    }

    /// A cloneable handle other processes use to enqueue messages for this
    /// one without touching its private heap (§3 invariant).
    #[must_use]
    pub fn sender(&self) -> MailboxSender {
        MailboxSender {
            sender: self.sender.clone(),
        }
    }

    /// Pops the oldest message, if any (§4.7 receive).
    pub fn try_recv(&self) -> Option<Reference> {
        self.receiver.try_recv().ok()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Returns every currently queued message without consuming it, for GC
    /// root enumeration (§4.3). Drains the channel and re-sends each message
    /// in order, since `crossbeam_channel::Receiver` has no peek API.
    #[must_use]
    pub fn pending_messages(&self) -> Vec<Reference> {
        let mut messages = Vec::with_capacity(self.receiver.len());
        while let Ok(message) = self.receiver.try_recv() {
            messages.push(message);
        }
        for message in &messages {
            let _ = self.sender.send(*message);
        }
        messages
    }
}

/// A handle another process (or the runtime, on its behalf) uses to enqueue
/// a message. Cloning and sending across threads is the whole point.
#[derive(Clone)]
pub struct MailboxSender {
    sender: Sender<Reference>,
}

impl MailboxSender {
    pub fn send(&self, value: Reference) {
        // An unbounded channel's only send failure is a dropped receiver,
        // which means the target process is already gone; silently drop
        // the message rather than panic the sender.
        let _ = self.sender.send(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_per_sender() {
        let mailbox = Mailbox::new();
        let sender = mailbox.sender();
        sender.send(Reference::int(1));
        sender.send(Reference::int(2));
        assert_eq!(mailbox.try_recv().unwrap().as_int(), Some(1));
        assert_eq!(mailbox.try_recv().unwrap().as_int(), Some(2));
        assert!(mailbox.try_recv().is_none());
    }

    #[test]
    fn empty_mailbox_has_no_messages() {
        let mailbox = Mailbox::new();
        assert!(mailbox.is_empty());
        assert!(mailbox.try_recv().is_none());
    }

    proptest::proptest! {
        /// (§8 item 4) For any sequence of sends from a single sender, the
        /// receiver dequeues them in the same order.
        #[test]
        fn fifo_holds_for_any_send_sequence(values in proptest::collection::vec(proptest::prelude::any::<i32>(), 0..64)) {
            let mailbox = Mailbox::new();
            let sender = mailbox.sender();
            for v in &values {
                sender.send(Reference::int(i64::from(*v)));
            }
            for v in &values {
                proptest::prop_assert_eq!(mailbox.try_recv().and_then(|r| r.as_int()), Some(i64::from(*v)));
            }
            proptest::prop_assert!(mailbox.try_recv().is_none());
        }
    }
}
