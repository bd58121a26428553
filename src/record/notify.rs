//! Value-changed notifications for record fields.
//!
//! A subscriber registers interest in a field and receives a
//! `tokio::sync::watch` receiver. Ordinary writes only notify when the value
//! actually changed; forced notifications fire even when the bytes are the
//! same, which is how a fresh acquisition with identical data still reaches
//! consumers.

use std::collections::HashMap;
use tokio::sync::watch;

use crate::field::FieldValue;

/// Watch channels of one record, keyed by field name.
#[derive(Default)]
pub struct FieldWatchers {
    senders: HashMap<&'static str, watch::Sender<FieldValue>>,
}

impl std::fmt::Debug for FieldWatchers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldWatchers")
            .field("fields", &self.senders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FieldWatchers {
    pub(crate) fn subscribe(
        &mut self,
        field: &'static str,
        current: FieldValue,
    ) -> watch::Receiver<FieldValue> {
        match self.senders.get(field) {
            Some(sender) => {
                sender.send_if_modified(|value| {
                    if *value != current {
                        *value = current;
                        true
                    } else {
                        false
                    }
                });
                sender.subscribe()
            }
            None => {
                let (sender, receiver) = watch::channel(current);
                self.senders.insert(field, sender);
                receiver
            }
        }
    }

    /// True if at least one live receiver exists for `field`.
    pub fn is_watched(&self, field: &str) -> bool {
        self.senders
            .get(field)
            .is_some_and(|sender| sender.receiver_count() > 0)
    }

    /// Publish a new value. Returns true if subscribers were notified.
    ///
    /// Without `force`, an unchanged value is suppressed.
    pub fn notify(&self, field: &str, value: FieldValue, force: bool) -> bool {
        let Some(sender) = self.senders.get(field) else {
            return false;
        };
        if sender.receiver_count() == 0 {
            return false;
        }
        sender.send_if_modified(|current| {
            if force || *current != value {
                *current = value;
                true
            } else {
                false
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_values_are_suppressed_unless_forced() {
        let mut watchers = FieldWatchers::default();
        let rx = watchers.subscribe("new_data_available", FieldValue::bool(true));

        assert!(!watchers.notify("new_data_available", FieldValue::bool(true), false));
        assert!(!rx.has_changed().unwrap());

        assert!(watchers.notify("new_data_available", FieldValue::bool(true), true));
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn unwatched_fields_do_not_notify() {
        let watchers = FieldWatchers::default();
        assert!(!watchers.is_watched("busy"));
        assert!(!watchers.notify("busy", FieldValue::bool(false), true));
    }

    #[test]
    fn dropped_receivers_stop_notifications() {
        let mut watchers = FieldWatchers::default();
        let rx = watchers.subscribe("busy", FieldValue::bool(false));
        assert!(watchers.is_watched("busy"));
        drop(rx);
        assert!(!watchers.is_watched("busy"));
    }
}
